//! Verb dispatch: one envelope, one store operation, one JSON result.

use crate::envelope::{reconcile_id, Envelope};
use crate::error::{BookingError, Result};
use crate::sqlite::{
    CreateOperation, CrudOperation, CrudOutcome, DeleteOperation, Query, ReadOperation, Record,
    SqliteStore, StoreConfig, UpdateOperation, ID_FIELD,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Operation selector taken from the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    #[default]
    Get,
    Post,
    Patch,
    Delete,
    List,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::List => "list",
        }
    }
}

impl FromStr for Verb {
    type Err = BookingError;

    /// Exact, case-sensitive match.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(Verb::Get),
            "post" => Ok(Verb::Post),
            "patch" => Ok(Verb::Patch),
            "delete" => Ok(Verb::Delete),
            "list" => Ok(Verb::List),
            other => Err(BookingError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful command result, serialized straight to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Record(Record),
    Records(Vec<Record>),
    Success { success: bool },
}

impl Response {
    fn success() -> Self {
        Response::Success { success: true }
    }
}

/// Run one verb against an open store.
pub fn dispatch(store: &mut SqliteStore, verb: Verb, envelope: &Envelope) -> Result<Response> {
    let operation = plan(verb, envelope)?;
    tracing::debug!(%verb, ?operation, "dispatching");
    let lookup = match &operation {
        CrudOperation::Read(read) if verb == Verb::Get => Some(read.query.clone()),
        _ => None,
    };
    match (lookup, store.execute_crud(operation)?) {
        (Some(query), CrudOutcome::Rows(rows)) => single(rows, &query),
        (None, CrudOutcome::Rows(rows)) if verb == Verb::List => Ok(Response::Records(rows)),
        (_, _) => Ok(Response::success()),
    }
}

/// Full invocation: validate the verb and the envelope, then open the store
/// for exactly one operation. The store is closed before this returns.
pub fn handle(verb: Option<&str>, input: &str, config: &StoreConfig) -> Result<Response> {
    let verb = verb.map(str::parse::<Verb>).transpose()?.unwrap_or_default();
    let envelope = Envelope::parse(input)?;
    // Build the operation before touching the store so input errors never
    // depend on store availability.
    plan(verb, &envelope)?;
    let mut store = SqliteStore::open(config)?;
    dispatch(&mut store, verb, &envelope)
}

/// Translate a verb and its envelope into a store operation.
fn plan(verb: Verb, envelope: &Envelope) -> Result<CrudOperation> {
    let operation = match verb {
        Verb::Get => CrudOperation::Read(ReadOperation {
            query: Query::by_id(envelope.require_arg_id()?),
            order_by: None,
        }),
        Verb::List => CrudOperation::Read(ReadOperation {
            query: Query::new(),
            order_by: Some(vec![(ID_FIELD.to_string(), true)]),
        }),
        Verb::Post => {
            let mut data = envelope.require_data()?;
            let id = reconcile_id(envelope.arg_id()?, &mut data)?
                .ok_or_else(|| BookingError::malformed("missing `args.id`"))?;
            data.insert(0, (ID_FIELD.to_string(), id.clone()));
            CrudOperation::Create(CreateOperation {
                key: Query::by_id(id),
                data,
            })
        }
        Verb::Patch => {
            let id = envelope.require_arg_id()?;
            let mut updates = envelope.require_data()?;
            reconcile_id(Some(id.clone()), &mut updates)?;
            CrudOperation::Update(UpdateOperation {
                query: Query::by_id(id),
                updates,
            })
        }
        Verb::Delete => CrudOperation::Delete(DeleteOperation {
            query: Query::by_id(envelope.require_arg_id()?),
        }),
    };
    Ok(operation)
}

fn single(mut rows: Vec<Record>, query: &Query) -> Result<Response> {
    match rows.len() {
        1 => Ok(Response::Record(rows.remove(0))),
        0 => Err(BookingError::NotFound { key: query.describe() }),
        count => Err(BookingError::Ambiguous { key: query.describe(), count }),
    }
}

use crate::domain::user::UserId;
use crate::error::{DispatchError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Register,
    Recharge,
    Withdraw,
    Settle,
    Create,
    Pay,
    Publish,
    Modify,
    Accept,
    Submit,
    Review,
    Advance,
    Tick,
}

/// One row of a command file.
///
/// Columns are shared by every operation; each operation reads the ones it
/// needs:
///
/// | op         | actor   | order       | sub       | amount | detail                             |
/// |------------|---------|-------------|-----------|--------|------------------------------------|
/// | `register` | user id |             |           |        | role                               |
/// | `recharge` | user id | trade label |           | major  |                                    |
/// | `withdraw` | user id | trade label |           | major  |                                    |
/// | `settle`   |         | trade label |           |        | `success`, `fail` or `closed`      |
/// | `create`   | owner   | order label |           |        | `platform:total:deadline_seconds`  |
/// | `pay`      |         | order label |           |        |                                    |
/// | `publish`  | owner   | order label |           |        | `platform:total:deadline_seconds`  |
/// | `modify`   |         | order label |           |        | `platform:total:deadline_seconds`  |
/// | `accept`   | worker  | order label | sub label |        |                                    |
/// | `submit`   |         | order label | sub label |        | content                            |
/// | `review`   | auditor | order label | sub label |        | `approve` or `reject`              |
/// | `advance`  |         |             |           |        | seconds                            |
/// | `tick`     |         |             |           |        |                                    |
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Command {
    pub op: Op,
    pub actor: Option<UserId>,
    pub order: Option<String>,
    pub sub: Option<String>,
    pub amount: Option<Decimal>,
    pub detail: Option<String>,
}

impl Command {
    pub fn actor(&self) -> Result<UserId> {
        self.actor.ok_or_else(|| self.missing("actor"))
    }

    pub fn order(&self) -> Result<&str> {
        self.order.as_deref().ok_or_else(|| self.missing("order"))
    }

    pub fn sub(&self) -> Result<&str> {
        self.sub.as_deref().ok_or_else(|| self.missing("sub"))
    }

    pub fn amount(&self) -> Result<Decimal> {
        self.amount.ok_or_else(|| self.missing("amount"))
    }

    pub fn detail(&self) -> Result<&str> {
        self.detail.as_deref().ok_or_else(|| self.missing("detail"))
    }

    fn missing(&self, column: &str) -> DispatchError {
        DispatchError::Validation(format!("{:?} requires the {column} column", self.op))
    }
}

/// Reads commands from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<Command>`.
/// It trims whitespace, accepts short rows and treats empty cells as absent.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes commands, one
    /// row at a time.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(DispatchError::from))
    }
}

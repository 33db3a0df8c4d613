use crate::domain::user::{Role, User, UserId};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct WalletRow {
    user: UserId,
    role: Role,
    /// Balance in major units.
    balance: Decimal,
}

/// Writes the wallet report as CSV: one `user,role,balance` row per user.
pub struct WalletWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> WalletWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_wallets(&mut self, users: impl IntoIterator<Item = User>) -> Result<()> {
        for user in users {
            self.writer.serialize(WalletRow {
                user: user.id,
                role: user.role,
                balance: user.balance().to_major(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Balance;

    #[test]
    fn test_report_uses_major_units() {
        let mut publisher = User::new(1, Role::Publisher, "wx-1", "one");
        publisher.set_balance(Balance::new(30_050));
        let worker = User::new(2, Role::Worker, "wx-2", "two");

        let mut out = Vec::new();
        WalletWriter::new(&mut out)
            .write_wallets(vec![publisher, worker])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "user,role,balance\n1,publisher,300.50\n2,worker,0.00\n");
    }
}

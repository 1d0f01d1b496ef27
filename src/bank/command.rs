use crate::common::error::CommandError;
use crate::consensus::Transaction;

/// Parses one submission line:
///
/// ```text
/// DEPOSIT <account> <amount>
/// TRANSFER <from> -> <to> <amount>
/// ```
///
/// Only the first character of the marker is significant.
pub fn parse_command(line: &str) -> Result<Transaction, CommandError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let marker = fields.first().ok_or(CommandError::Empty)?;

    match marker.chars().next() {
        Some('D') => {
            let [_, account, amount] = fields[..] else {
                return Err(CommandError::Arity {
                    expected: 3,
                    found: fields.len(),
                });
            };
            Ok(Transaction::deposit(account, parse_amount(amount)?))
        }
        Some('T') => {
            let [_, from, _, to, amount] = fields[..] else {
                return Err(CommandError::Arity {
                    expected: 5,
                    found: fields.len(),
                });
            };
            Ok(Transaction::transfer(from, to, parse_amount(amount)?))
        }
        _ => Err(CommandError::UnknownMarker(marker.to_string())),
    }
}

fn parse_amount(raw: &str) -> Result<u64, CommandError> {
    raw.parse()
        .map_err(|_| CommandError::InvalidAmount(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deposit() {
        assert_eq!(
            parse_command("DEPOSIT wqkby 10").unwrap(),
            Transaction::deposit("wqkby", 10)
        );
    }

    #[test]
    fn test_parse_transfer() {
        assert_eq!(
            parse_command("TRANSFER yxpqg -> wqkby 13").unwrap(),
            Transaction::transfer("yxpqg", "wqkby", 13)
        );
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert_eq!(parse_command("   "), Err(CommandError::Empty));
        assert_eq!(
            parse_command("WITHDRAW a 1"),
            Err(CommandError::UnknownMarker("WITHDRAW".into()))
        );
        assert_eq!(
            parse_command("DEPOSIT a"),
            Err(CommandError::Arity { expected: 3, found: 2 })
        );
        assert_eq!(
            parse_command("TRANSFER a b 3"),
            Err(CommandError::Arity { expected: 5, found: 4 })
        );
        assert_eq!(
            parse_command("DEPOSIT a -4"),
            Err(CommandError::InvalidAmount("-4".into()))
        );
    }
}

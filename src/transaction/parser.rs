use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{NodeError, NodeResult};
use crate::protocol::{Operation, Transaction, TransactionKind};

static BEGIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^b(\d)?$").unwrap());
static READ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^r\((-?\d+)\)$").unwrap());
static WRITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^w\((-?\d+),(-?\d+)\)$").unwrap());

/// Parse one transaction line: comma-separated tokens, `b` first (an
/// optional trailing digit names the read-only target tier), `c` last, and
/// `r(<key>)` / `w(<key>,<value>)` operations in between. Any write makes
/// the transaction an update, which only ever targets tier 0.
pub fn parse_line(line: &str) -> NodeResult<Transaction> {
    let tokens: Vec<&str> = line.split(',').map(str::trim).collect();

    if tokens.len() < 2 {
        return Err(NodeError::InvalidTransaction(format!(
            "expected at least 'b' and 'c' tokens, got {:?}",
            line
        )));
    }

    let begin = BEGIN_RE.captures(tokens[0]).ok_or_else(|| {
        NodeError::InvalidTransaction(format!("transaction must start with 'b', got {:?}", tokens[0]))
    })?;
    let declared_tier = match begin.get(1) {
        Some(digit) => {
            let tier = parse_int(digit.as_str())?;
            if !(0..=2).contains(&tier) {
                return Err(NodeError::InvalidTransaction(format!(
                    "target tier {} out of range",
                    tier
                )));
            }
            Some(tier)
        }
        None => None,
    };

    match tokens.last() {
        Some(&"c") => {}
        other => {
            return Err(NodeError::InvalidTransaction(format!(
                "transaction must end with 'c', got {:?}",
                other.unwrap_or(&"")
            )));
        }
    }

    let mut operations = Vec::new();
    for token in &tokens[1..tokens.len() - 1] {
        if let Some(caps) = READ_RE.captures(token) {
            operations.push(Operation::Read {
                key: parse_int(&caps[1])?,
            });
        } else if let Some(caps) = WRITE_RE.captures(token) {
            operations.push(Operation::Write {
                key: parse_int(&caps[1])?,
                value: parse_int(&caps[2])?,
            });
        } else {
            return Err(NodeError::InvalidTransaction(format!(
                "unrecognized operation {:?}",
                token
            )));
        }
    }

    let has_write = operations.iter().any(Operation::is_write);
    let txn = match declared_tier {
        Some(tier) => {
            // A trailing digit declares a read-only transaction; writes do
            // not belong in one.
            if has_write {
                return Err(NodeError::InvalidTransaction(
                    "write operation in a read-only transaction".to_string(),
                ));
            }
            Transaction {
                kind: TransactionKind::ReadOnly,
                target_tier: tier,
                operations,
            }
        }
        None => Transaction {
            kind: TransactionKind::Update,
            target_tier: 0,
            operations,
        },
    };

    txn.validate()?;
    Ok(txn)
}

fn parse_int(raw: &str) -> NodeResult<i32> {
    raw.parse::<i32>()
        .map_err(|_| NodeError::InvalidTransaction(format!("integer operand out of range: {}", raw)))
}

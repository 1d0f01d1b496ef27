use std::fmt;

use serde::{Deserialize, Serialize};

use super::peers::PeerId;

/*
    Every transaction travels through three message kinds:

      Transaction  originator -> all      "here is a new message, propose a number"
      Proposed     replica -> originator  "my tentative sequence number is s"
      Final        originator -> all      "agreed number is (s, tie_break)"

    Hello is only ever the first frame on a dialed connection.
*/

/// Globally unique name of one submission, rendered as `<origin>_<counter>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct MessageId {
    pub origin: PeerId,
    pub counter: u64,
}

impl MessageId {
    pub fn new(origin: impl Into<PeerId>, counter: u64) -> Self {
        MessageId {
            origin: origin.into(),
            counter,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.origin, self.counter)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Transaction {
    Deposit {
        account: String,
        amount: u64,
    },
    Transfer {
        from: String,
        to: String,
        amount: u64,
    },
}

impl Transaction {
    pub fn deposit(account: impl Into<String>, amount: u64) -> Self {
        Transaction::Deposit {
            account: account.into(),
            amount,
        }
    }

    pub fn transfer(from: impl Into<String>, to: impl Into<String>, amount: u64) -> Self {
        Transaction::Transfer {
            from: from.into(),
            to: to.into(),
            amount,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Envelope {
    Hello {
        node_id: PeerId,
    },
    Transaction {
        sender: PeerId,
        id: MessageId,
        transaction: Transaction,
    },
    Proposed {
        sender: PeerId,
        id: MessageId,
        seq: u64,
    },
    Final {
        sender: PeerId,
        id: MessageId,
        seq: u64,
        tie_break: PeerId,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Transaction { .. } => "transaction",
            Envelope::Proposed { .. } => "proposed",
            Envelope::Final { .. } => "final",
        }
    }

    pub fn wire_len(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_display() {
        let id = MessageId::new("node2", 36);
        assert_eq!(id.to_string(), "node2_36");
    }

    #[test]
    fn test_envelope_kind_and_size() {
        let env = Envelope::Final {
            sender: "a".into(),
            id: MessageId::new("a", 1),
            seq: 4,
            tie_break: "b".into(),
        };
        assert_eq!(env.kind(), "final");
        assert!(env.wire_len() > 0);
    }
}

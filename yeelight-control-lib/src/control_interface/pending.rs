use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::control_interface::command::{Command, CommandOutcome};
use crate::error::{Error, Result};

/// Where the response to a command is delivered.
pub type Reply = oneshot::Sender<Result<CommandOutcome>>;

/// A command that was written and is waiting for its response.
#[derive(Debug)]
pub struct PendingOperation {
    pub command: Command,
    pub reply: Reply,
}

/// Commands awaiting a response, keyed by correlation id.
///
/// Ids count up from 1 per connection and are never reused while pending.
#[derive(Debug)]
pub struct PendingTable {
    next_id: u64,
    operations: HashMap<u64, PendingOperation>,
}

impl Default for PendingTable {
    fn default() -> Self {
        PendingTable {
            next_id: 1,
            operations: HashMap::new(),
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next id to `command` and stores it.
    ///
    /// Returns the id together with the command as it will be sent.
    pub fn register(&mut self, mut command: Command, reply: Reply) -> (u64, Command) {
        let mut id = self.next_id;
        while self.operations.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        self.next_id = id.wrapping_add(1).max(1);

        command.id = Some(id);
        self.operations.insert(
            id,
            PendingOperation {
                command: command.clone(),
                reply,
            },
        );
        (id, command)
    }

    /// Removes and returns the operation waiting on `id`.
    pub fn complete(&mut self, id: u64) -> Option<PendingOperation> {
        self.operations.remove(&id)
    }

    /// Rejects every pending operation with [`Error::ConnectionClosed`].
    pub fn drain(&mut self) -> usize {
        let count = self.operations.len();
        for (_, operation) in self.operations.drain() {
            let _ = operation.reply.send(Err(Error::ConnectionClosed));
        }
        count
    }

    /// Starts numbering from 1 again. Only called between connections.
    pub fn reset(&mut self) {
        self.drain();
        self.next_id = 1;
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut table = PendingTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (id1, command1) = table.register(Command::toggle(), tx1);
        let (id2, _) = table.register(Command::toggle(), tx2);
        assert_eq!((id1, id2), (1, 2));
        assert_eq!(command1.id, Some(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_complete_removes_once() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        let (id, _) = table.register(Command::ping(), tx);
        let operation = table.complete(id).unwrap();
        assert_eq!(operation.command.id, Some(id));
        assert!(table.complete(id).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_drain_rejects_waiters() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table.register(Command::toggle(), tx);
        assert_eq!(table.drain(), 1);
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_reset_restarts_numbering() {
        let mut table = PendingTable::new();
        for _ in 0..3 {
            let (tx, _rx) = oneshot::channel();
            table.register(Command::toggle(), tx);
        }
        table.reset();
        assert!(table.is_empty());
        let (tx, _rx) = oneshot::channel();
        assert_eq!(table.register(Command::toggle(), tx).0, 1);
    }
}

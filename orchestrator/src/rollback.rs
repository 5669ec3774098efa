use std::sync::Mutex;

use data_model::Container;

/// What a journal record undoes: the action that was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RollbackAction {
    Create,
    Stop,
    Delete,
}

#[derive(Debug, Clone)]
pub struct RollbackRecord {
    pub container: Container,
    pub action: RollbackAction,
}

/// Append-only journal of the mutating steps of one update batch.
///
/// Appends are thread-safe; replay reads the records only after the
/// strategy body has finished (one job runs on one task). Records must be
/// undone in reverse insertion order: a DELETE that depended on an earlier
/// CREATE having happened has to be undone first.
#[derive(Default)]
pub struct RollbackJournal {
    records: Mutex<Vec<RollbackRecord>>,
}

impl RollbackJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, container: &Container, action: RollbackAction) {
        self.records.lock().unwrap().push(RollbackRecord {
            container: container.clone(),
            action,
        });
    }

    pub fn records(&self) -> Vec<RollbackRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_container;

    use super::*;

    #[test]
    fn test_records_keep_insertion_order() {
        let journal = RollbackJournal::new();
        let a = mock_container("a", "reg/app:1.0", "n1");
        let b = mock_container("b", "reg/app:1.0", "n1");
        journal.record(&a, RollbackAction::Create);
        journal.record(&b, RollbackAction::Stop);
        journal.record(&b, RollbackAction::Delete);

        let records = journal.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].action, RollbackAction::Create);
        assert_eq!(records[2].action, RollbackAction::Delete);
    }
}

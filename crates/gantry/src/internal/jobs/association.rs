use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::internal::common::error::GantryError;
use crate::internal::common::ids::{JobId, StepId, Uid};
use crate::internal::common::sync::lock;

/// Answers whether a user may charge an account in a partition.
pub trait AssociationFilter: Send + Sync {
    fn permits(&self, uid: Uid, account: &str, partition: &str) -> bool;
}

/// Accepts every association.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AssociationFilter for AllowAll {
    fn permits(&self, _uid: Uid, _account: &str, _partition: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    JobStart,
    JobEnd,
    StepStart,
    StepEnd,
    NodeDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub time: DateTime<Utc>,
    pub kind: TransactionKind,
    pub job_id: Option<JobId>,
    pub step_id: Option<StepId>,
    pub uid: Option<Uid>,
    pub info: String,
}

impl Transaction {
    pub fn new(kind: TransactionKind, info: String) -> Self {
        Transaction {
            time: Utc::now(),
            kind,
            job_id: None,
            step_id: None,
            uid: None,
            info,
        }
    }

    pub fn job(mut self, job_id: JobId, uid: Uid) -> Self {
        self.job_id = Some(job_id);
        self.uid = Some(uid);
        self
    }

    pub fn step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

/// Append-only sink for accounting records.
pub trait TransactionSink: Send + Sync {
    fn record(&self, transaction: Transaction);
}

/// Keeps transactions in memory.
#[derive(Debug, Default)]
pub struct MemoryTransactionLog {
    records: Mutex<Vec<Transaction>>,
}

impl MemoryTransactionLog {
    pub fn records(&self) -> Vec<Transaction> {
        lock(&self.records).clone()
    }

    pub fn count(&self, kind: &TransactionKind) -> usize {
        lock(&self.records).iter().filter(|t| &t.kind == kind).count()
    }
}

impl TransactionSink for MemoryTransactionLog {
    fn record(&self, transaction: Transaction) {
        log::debug!("Accounting record: {transaction:?}");
        lock(&self.records).push(transaction);
    }
}

/// Appends transactions to a writer, one JSON document per line.
pub struct JsonTransactionLog<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonTransactionLog<W> {
    pub fn new(writer: W) -> Self {
        JsonTransactionLog {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_record(writer: &mut W, transaction: &Transaction) -> crate::Result<()> {
        serde_json::to_writer(&mut *writer, transaction)?;
        writer.write_all(b"\n")?;
        writer.flush().map_err(GantryError::from)
    }
}

impl<W: Write + Send> TransactionSink for JsonTransactionLog<W> {
    fn record(&self, transaction: Transaction) {
        let mut writer = lock(&self.writer);
        if let Err(error) = Self::write_record(&mut writer, &transaction) {
            log::error!("Cannot write accounting record {transaction:?}: {error}");
        }
    }
}

impl<T: TransactionSink + ?Sized> TransactionSink for std::sync::Arc<T> {
    fn record(&self, transaction: Transaction) {
        (**self).record(transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let log = JsonTransactionLog::new(Vec::new());
        log.record(
            Transaction::new(TransactionKind::JobStart, "n[0-3]".to_string())
                .job(JobId::new(4), 1000),
        );
        log.record(
            Transaction::new(TransactionKind::StepEnd, "n0".to_string())
                .job(JobId::new(4), 1000)
                .step(StepId::new(2)),
        );
        let output = String::from_utf8(log.into_inner()).unwrap();
        let records: Vec<Transaction> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, TransactionKind::JobStart);
        assert_eq!(records[0].info, "n[0-3]");
        assert_eq!(records[0].step_id, None);
        assert_eq!(records[1].job_id, Some(JobId::new(4)));
        assert_eq!(records[1].step_id, Some(StepId::new(2)));
        assert_eq!(records[1].uid, Some(1000));
    }
}

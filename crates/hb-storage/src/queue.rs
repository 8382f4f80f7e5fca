use crate::layer::StoredIn;
use crate::StorageError;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Set,
    Remove,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Set => "set",
            OpKind::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    Keys(Vec<String>),
    Entries(BTreeMap<String, Value>),
}

impl OpPayload {
    pub fn keys(&self) -> Vec<String> {
        match self {
            OpPayload::Keys(keys) => keys.clone(),
            OpPayload::Entries(entries) => entries.keys().cloned().collect(),
        }
    }
}

#[derive(Debug)]
pub enum OpResult {
    Values(BTreeMap<String, Value>),
    Applied(StoredIn),
}

pub type OpResponder = oneshot::Sender<Result<OpResult, StorageError>>;

#[derive(Debug)]
pub struct StorageOp {
    pub seq: u64,
    pub kind: OpKind,
    pub payload: OpPayload,
    pub enqueued_at: Instant,
    responder: OpResponder,
}

impl StorageOp {
    pub fn complete(self, result: Result<OpResult, StorageError>) {
        // The caller may have stopped waiting; that is fine.
        let _ = self.responder.send(result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    FlushNow,
    /// First operation of a new batch; arm the idle timer for this epoch.
    ArmIdleTimer(u64),
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingValue {
    Set(Value),
    Removed,
}

#[derive(Debug)]
pub struct OpQueue {
    pending: VecDeque<StorageOp>,
    batch_size: usize,
    next_seq: u64,
    epoch: u64,
}

impl OpQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            batch_size: batch_size.max(1),
            next_seq: 0,
            epoch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Incremented on every drain so stale idle timers can tell they lost.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn push(
        &mut self,
        kind: OpKind,
        payload: OpPayload,
    ) -> (oneshot::Receiver<Result<OpResult, StorageError>>, PushOutcome) {
        let (responder, receiver) = oneshot::channel();
        self.next_seq += 1;
        self.pending.push_back(StorageOp {
            seq: self.next_seq,
            kind,
            payload,
            enqueued_at: Instant::now(),
            responder,
        });

        let outcome = if self.pending.len() >= self.batch_size {
            PushOutcome::FlushNow
        } else if self.pending.len() == 1 {
            PushOutcome::ArmIdleTimer(self.epoch)
        } else {
            PushOutcome::Queued
        };
        (receiver, outcome)
    }

    pub fn drain(&mut self) -> Vec<StorageOp> {
        self.epoch += 1;
        self.pending.drain(..).collect()
    }

    pub fn pending_keys(&self) -> HashSet<String> {
        self.pending
            .iter()
            .filter(|op| op.kind != OpKind::Get)
            .flat_map(|op| op.payload.keys())
            .collect()
    }

    pub fn pending_value(&self, key: &str) -> Option<PendingValue> {
        self.pending.iter().rev().find_map(|op| match (&op.kind, &op.payload) {
            (OpKind::Set, OpPayload::Entries(entries)) => {
                entries.get(key).cloned().map(PendingValue::Set)
            }
            (OpKind::Remove, OpPayload::Keys(keys)) if keys.iter().any(|k| k == key) => {
                Some(PendingValue::Removed)
            }
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct Batch {
    pub kind: OpKind,
    pub ops: Vec<StorageOp>,
}

impl Batch {
    /// Later writes win for keys written more than once.
    pub fn merged_entries(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for op in &self.ops {
            if let OpPayload::Entries(entries) = &op.payload {
                merged.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }

    pub fn merged_keys(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.ops
            .iter()
            .flat_map(|op| op.payload.keys())
            .filter(|key| seen.insert(key.clone()))
            .collect()
    }
}

/// Groups drained operations into consecutive runs of the same kind, so a
/// removal queued after a write of the same key still lands after it.
pub fn coalesce(ops: Vec<StorageOp>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for op in ops {
        match batches.last_mut() {
            Some(batch) if batch.kind == op.kind => batch.ops.push(op),
            _ => batches.push(Batch {
                kind: op.kind,
                ops: vec![op],
            }),
        }
    }
    batches
}

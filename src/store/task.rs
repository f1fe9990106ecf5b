use crate::{
    error::{AppResult, ErrorReason},
    types::BoundCertRecord,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// Completion handle of a store operation.
///
/// Resolves exactly once. A handle returned after the load has completed is
/// already resolved; one returned before resolves while the queue drains.
#[derive(Debug)]
#[must_use = "the result of the operation is only observable through the handle"]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self { rx })
    }

    pub(crate) fn ready(value: T) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(value);
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = AppResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.map_err(|_| ErrorReason::Abandoned.into()))
    }
}

#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, value: T) {
        if self.tx.send(value).is_err() {
            trace!("Completion handle dropped before the result was delivered");
        }
    }
}

/// An operation deferred until the backing store finishes loading.
#[derive(Debug)]
pub(crate) enum PendingTask {
    Get {
        server_identifier: String,
        completer: Completer<Option<BoundCertRecord>>,
    },
    Set {
        record: BoundCertRecord,
    },
    Delete {
        server_identifier: String,
        completer: Completer<()>,
    },
    DeleteRange {
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        completer: Completer<()>,
    },
    GetAll {
        completer: Completer<Vec<BoundCertRecord>>,
    },
    InitializeFrom {
        records: Vec<BoundCertRecord>,
    },
}

impl PendingTask {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PendingTask::Get { .. } => "get",
            PendingTask::Set { .. } => "set",
            PendingTask::Delete { .. } => "delete",
            PendingTask::DeleteRange { .. } => "delete_range",
            PendingTask::GetAll { .. } => "get_all",
            PendingTask::InitializeFrom { .. } => "initialize_from",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_handle_resolves_immediately() {
        let pending = Pending::ready(42);
        assert_eq!(pending.now_or_never().unwrap().unwrap(), 42);
    }

    #[test]
    fn handle_waits_for_completion() {
        let (completer, mut pending) = Pending::<u8>::channel();
        assert!((&mut pending).now_or_never().is_none());

        completer.complete(7);
        assert_eq!(pending.now_or_never().unwrap().unwrap(), 7);
    }

    #[test]
    fn dropped_completer_abandons_the_handle() {
        let (completer, pending) = Pending::<()>::channel();
        drop(completer);

        let err = pending.now_or_never().unwrap().unwrap_err();
        assert!(matches!(err.reason(), ErrorReason::Abandoned));
    }
}

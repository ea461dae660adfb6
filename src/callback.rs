use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::utils::Timings;

/// A pipeline stage: accepts values one at a time, hands back its result
/// (and any captured error) when the stage is drained.
pub trait CallFinish: Send + 'static {
    type CallType: Send;
    type ReturnType: Send;
    fn call(&mut self, c: Self::CallType);
    fn finish(&mut self) -> Result<Self::ReturnType>;
}

/// Cooperative cancellation, checked at queue boundaries. Cancelled
/// stages keep draining their queues but stop processing the contents.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// A cancelled stage still finishes (dropping queues and closing files),
// but its result is replaced by Interrupted unless the stage captured a
// more specific error itself.
fn finish_cancelled<U>(res: Result<U>, cancel: &CancelFlag) -> Result<U> {
    if cancel.is_cancelled() {
        match res {
            Err(e) => Err(e),
            Ok(_) => Err(Error::new(ErrorKind::Interrupted, "cancelled")),
        }
    } else {
        res
    }
}

fn call_all<T: Send + 'static, U: Send + 'static>(
    recv: mpsc::Receiver<T>,
    mut cf: Box<impl CallFinish<CallType = T, ReturnType = U>>,
    cancel: CancelFlag,
) -> Result<U> {
    for m in recv.iter() {
        if !cancel.is_cancelled() {
            cf.call(m);
        }
    }
    finish_cancelled(cf.finish(), &cancel)
}

fn call_all_shared<T: Send + 'static, U: Send + 'static>(
    recv: Arc<Mutex<mpsc::Receiver<T>>>,
    mut cf: Box<dyn CallFinish<CallType = T, ReturnType = U>>,
    cancel: CancelFlag,
) -> Result<U> {
    loop {
        let m = recv.lock().unwrap().recv();
        match m {
            Ok(m) => {
                if !cancel.is_cancelled() {
                    cf.call(m);
                }
            }
            Err(_) => {
                break;
            }
        }
    }
    finish_cancelled(cf.finish(), &cancel)
}

fn join_err<E: std::fmt::Debug>(e: E) -> Error {
    Error::new(ErrorKind::Other, format!("failed to join {:?}", e))
}

/// Runs the wrapped stage on its own thread behind a bounded queue.
/// `call` blocks when the queue is full; `finish` closes the queue,
/// joins the thread and surfaces its result.
pub struct Callback<T, U> {
    send: Option<mpsc::SyncSender<T>>,
    result: Option<thread::JoinHandle<Result<U>>>,
    cancel: CancelFlag,
}

impl<T, U> Callback<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new(cf: Box<impl CallFinish<CallType = T, ReturnType = U>>) -> Callback<T, U> {
        Self::with_capacity(cf, 1)
    }

    pub fn with_capacity(
        cf: Box<impl CallFinish<CallType = T, ReturnType = U>>,
        queue_size: usize,
    ) -> Callback<T, U> {
        let cancel = CancelFlag::new();
        let (send, recv) = mpsc::sync_channel(queue_size);
        let cc = cancel.clone();
        let result = thread::spawn(move || call_all(recv, cf, cc));

        Callback {
            send: Some(send),
            result: Some(result),
            cancel: cancel,
        }
    }

    /// A cloneable sender into this stage's queue, so several upstream
    /// workers can feed one sink. All handles must be finished before
    /// this Callback's own finish will join.
    pub fn sink_handle(&self) -> SinkHandle<T> {
        SinkHandle {
            send: Some(self.send.as_ref().expect("callback already finished").clone()),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

impl<T, U> CallFinish for Callback<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    type CallType = T;
    type ReturnType = U;

    fn call(&mut self, t: T) {
        match &self.send {
            Some(s) => {
                s.send(t).expect("failed to send");
            }
            _ => {}
        }
    }

    fn finish(&mut self) -> Result<U> {
        self.send = None;

        match self.result.take() {
            Some(r) => match r.join() {
                Ok(p) => p,
                Err(e) => Err(join_err(e)),
            },
            None => Err(Error::new(ErrorKind::Other, "already called finish")),
        }
    }
}

/// A cloneable handle feeding some Callback's queue. Dropping (or
/// finishing) every handle plus the Callback's own sender closes the
/// queue.
pub struct SinkHandle<T> {
    send: Option<mpsc::SyncSender<T>>,
}

impl<T: Send + 'static> CallFinish for SinkHandle<T> {
    type CallType = T;
    type ReturnType = ();

    fn call(&mut self, t: T) {
        match &self.send {
            Some(s) => {
                s.send(t).expect("failed to send");
            }
            _ => {}
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.send = None;
        Ok(())
    }
}

/// Merges the per-worker results of a CallbackPool.
pub trait CollectResult: Send + 'static {
    type InType;
    type OutType;
    fn collect(&self, a: Vec<Self::InType>) -> Self::OutType;
}

pub struct MergeTimings<T>(PhantomData<fn() -> T>);

impl<T> MergeTimings<T> {
    pub fn new() -> MergeTimings<T> {
        MergeTimings(PhantomData)
    }
}

impl<T: Send + 'static> CollectResult for MergeTimings<T> {
    type InType = Timings<T>;
    type OutType = Timings<T>;

    fn collect(&self, a: Vec<Timings<T>>) -> Timings<T> {
        let mut res = Timings::new();
        for t in a {
            res.combine(t);
        }
        res
    }
}

/// N worker threads draining one shared bounded queue. The shared queue
/// matters: a worker blocked elsewhere (e.g. on the ways-done latch)
/// must not stall delivery to its peers, so work is pulled, not dealt.
pub struct CallbackPool<T, U, V> {
    send: Option<mpsc::SyncSender<T>>,
    results: Vec<thread::JoinHandle<Result<U>>>,
    collect: Box<dyn CollectResult<InType = U, OutType = V>>,
    cancel: CancelFlag,
}

impl<T, U, V> CallbackPool<T, U, V>
where
    T: Send + 'static,
    U: Send + 'static,
    V: Send + 'static,
{
    pub fn new(
        cfs: Vec<Box<dyn CallFinish<CallType = T, ReturnType = U>>>,
        queue_size: usize,
        collect: Box<dyn CollectResult<InType = U, OutType = V>>,
    ) -> CallbackPool<T, U, V> {
        Self::with_cancel(cfs, queue_size, collect, CancelFlag::new())
    }

    pub fn with_cancel(
        cfs: Vec<Box<dyn CallFinish<CallType = T, ReturnType = U>>>,
        queue_size: usize,
        collect: Box<dyn CollectResult<InType = U, OutType = V>>,
        cancel: CancelFlag,
    ) -> CallbackPool<T, U, V> {
        if cfs.is_empty() {
            panic!("CallbackPool needs at least one worker");
        }
        let (send, recv) = mpsc::sync_channel(queue_size);
        let recv = Arc::new(Mutex::new(recv));

        let mut results = Vec::new();
        for cf in cfs {
            let rc = recv.clone();
            let cc = cancel.clone();
            results.push(thread::spawn(move || call_all_shared(rc, cf, cc)));
        }

        CallbackPool {
            send: Some(send),
            results: results,
            collect: collect,
            cancel: cancel,
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

impl<T, U, V> CallFinish for CallbackPool<T, U, V>
where
    T: Send + 'static,
    U: Send + 'static,
    V: Send + 'static,
{
    type CallType = T;
    type ReturnType = V;

    fn call(&mut self, t: T) {
        match &self.send {
            Some(s) => {
                s.send(t).expect("failed to send");
            }
            _ => {}
        }
    }

    fn finish(&mut self) -> Result<V> {
        self.send = None;

        // peers of a failed worker report Interrupted; keep the specific
        // error that caused the cancellation, whichever worker held it
        let mut res = Vec::new();
        let mut err: Option<Error> = None;
        for r in std::mem::take(&mut self.results) {
            let e = match r.join() {
                Ok(Ok(u)) => {
                    res.push(u);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => join_err(e),
            };
            match &err {
                None => {
                    err = Some(e);
                }
                Some(prev) => {
                    if prev.kind() == ErrorKind::Interrupted && e.kind() != ErrorKind::Interrupted
                    {
                        err = Some(e);
                    }
                }
            }
        }

        match err {
            Some(e) => Err(e),
            None => Ok(self.collect.collect(res)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Summer {
        total: i64,
    }
    impl CallFinish for Summer {
        type CallType = i64;
        type ReturnType = i64;
        fn call(&mut self, v: i64) {
            self.total += v;
        }
        fn finish(&mut self) -> Result<i64> {
            Ok(self.total)
        }
    }

    struct SumAll;
    impl CollectResult for SumAll {
        type InType = i64;
        type OutType = i64;
        fn collect(&self, a: Vec<i64>) -> i64 {
            a.iter().sum()
        }
    }

    #[test]
    fn test_callback_runs_and_returns() {
        let mut cb = Callback::new(Box::new(Summer { total: 0 }));
        for i in 1..=10 {
            cb.call(i);
        }
        assert_eq!(cb.finish().unwrap(), 55);
    }

    #[test]
    fn test_callback_pool_shared_queue() {
        let workers: Vec<Box<dyn CallFinish<CallType = i64, ReturnType = i64>>> = (0..4)
            .map(|_| Box::new(Summer { total: 0 }) as Box<dyn CallFinish<CallType = i64, ReturnType = i64>>)
            .collect();
        let mut pool = CallbackPool::new(workers, 8, Box::new(SumAll));
        for i in 1..=1000 {
            pool.call(i);
        }
        assert_eq!(pool.finish().unwrap(), 500500);
    }

    #[test]
    fn test_cancelled_pool_reports_interrupted() {
        let workers: Vec<Box<dyn CallFinish<CallType = i64, ReturnType = i64>>> = (0..2)
            .map(|_| Box::new(Summer { total: 0 }) as Box<dyn CallFinish<CallType = i64, ReturnType = i64>>)
            .collect();
        let mut pool = CallbackPool::new(workers, 4, Box::new(SumAll));
        pool.cancel_flag().cancel();
        for i in 1..=100 {
            pool.call(i);
        }
        let err = pool.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }

    struct FailOnFive {
        cancel: CancelFlag,
        err: Option<Error>,
    }
    impl CallFinish for FailOnFive {
        type CallType = i64;
        type ReturnType = i64;
        fn call(&mut self, v: i64) {
            if v == 5 {
                self.err = Some(Error::new(ErrorKind::Other, "boom"));
                self.cancel.cancel();
            }
        }
        fn finish(&mut self) -> Result<i64> {
            match self.err.take() {
                Some(e) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_worker_error_beats_interrupted() {
        let cancel = CancelFlag::new();
        let workers: Vec<Box<dyn CallFinish<CallType = i64, ReturnType = i64>>> = (0..2)
            .map(|_| {
                Box::new(FailOnFive {
                    cancel: cancel.clone(),
                    err: None,
                }) as Box<dyn CallFinish<CallType = i64, ReturnType = i64>>
            })
            .collect();
        let mut pool = CallbackPool::with_cancel(workers, 4, Box::new(SumAll), cancel);
        for i in 1..=100 {
            pool.call(i);
        }
        // one worker captured the real error and cancelled its peer; the
        // peer's Interrupted must not mask it
        let err = pool.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.to_string(), "boom");
    }

    struct Forwarder {
        out: SinkHandle<i64>,
    }
    impl CallFinish for Forwarder {
        type CallType = i64;
        type ReturnType = ();
        fn call(&mut self, v: i64) {
            self.out.call(v * 2);
        }
        fn finish(&mut self) -> Result<()> {
            self.out.finish()
        }
    }

    #[test]
    fn test_sink_handles_feed_one_callback() {
        let sink = Callback::new(Box::new(Summer { total: 0 }));

        let workers: Vec<Box<dyn CallFinish<CallType = i64, ReturnType = ()>>> = (0..3)
            .map(|_| {
                Box::new(Forwarder {
                    out: sink.sink_handle(),
                }) as Box<dyn CallFinish<CallType = i64, ReturnType = ()>>
            })
            .collect();

        let mut pool = CallbackPool::new(workers, 4, Box::new(DropAll));
        for i in 1..=10 {
            pool.call(i);
        }
        pool.finish().unwrap();

        let mut sink = sink;
        assert_eq!(sink.finish().unwrap(), 110);
    }

    struct DropAll;
    impl CollectResult for DropAll {
        type InType = ();
        type OutType = ();
        fn collect(&self, _a: Vec<()>) {}
    }
}

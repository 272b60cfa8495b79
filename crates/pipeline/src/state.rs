//! Per-group execution state and the managers that hand it out.
//!
//! A `State` carries everything a group accumulates across events: the
//! shared scope, per-activity private storage, and the per-activity timer
//! and ticker holders that can resume a stalled pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::activity::SharedData;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, PipelineResult};
use crate::scope::SharedScope;

/// Routes a discriminator to the state owning that group.
pub trait StateManager: Send + Sync {
    fn get_state(&self, discriminator: &str) -> Arc<State>;

    /// Stops every timer held by every state.
    fn teardown(&self);
}

/// Returns one process-shared state regardless of discriminator. Used when
/// no grouping is configured.
pub struct SingleStateManager {
    state: Arc<State>,
}

impl SingleStateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State::new()),
        }
    }
}

impl Default for SingleStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager for SingleStateManager {
    fn get_state(&self, _discriminator: &str) -> Arc<State> {
        self.state.clone()
    }

    fn teardown(&self) {
        self.state.teardown();
    }
}

/// Lazily creates one state per distinct discriminator.
pub struct MultiStateManager {
    states: RwLock<HashMap<String, Arc<State>>>,
}

impl MultiStateManager {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MultiStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager for MultiStateManager {
    fn get_state(&self, discriminator: &str) -> Arc<State> {
        // fast path
        if let Some(state) = self.states.read().unwrap().get(discriminator) {
            return state.clone();
        }

        let mut states = self.states.write().unwrap();
        states
            .entry(discriminator.to_string())
            .or_insert_with(|| Arc::new(State::new()))
            .clone()
    }

    fn teardown(&self) {
        for state in self.states.read().unwrap().values() {
            state.teardown();
        }
    }
}

/// The mutable unit of one group. Activity identity is the stage slot index.
pub struct State {
    scope: Arc<SharedScope>,
    shared_data: RwLock<HashMap<usize, SharedData>>,
    timers: Mutex<HashMap<usize, Arc<TimerHolder>>>,
    tickers: Mutex<HashMap<usize, Arc<TickerHolder>>>,
}

impl State {
    fn new() -> Self {
        Self {
            scope: Arc::new(SharedScope::new()),
            shared_data: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
        }
    }

    /// The mutable pipeline-level scope of this group.
    pub fn scope(&self) -> Arc<SharedScope> {
        self.scope.clone()
    }

    /// The private storage of `activity` within this group, created on
    /// first use.
    pub fn shared_data(&self, activity: usize) -> SharedData {
        if let Some(data) = self.shared_data.read().unwrap().get(&activity) {
            return data.clone();
        }

        let mut map = self.shared_data.write().unwrap();
        map.entry(activity)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    /// Registers a repeating timer for `activity`. Fails when one already
    /// exists.
    pub fn new_ticker(
        &self,
        activity: usize,
        interval: Duration,
    ) -> PipelineResult<(Arc<TickerHolder>, flume::Receiver<()>)> {
        let mut tickers = self.tickers.lock().unwrap();
        if tickers.contains_key(&activity) {
            return Err(PipelineError::DuplicateTimer { kind: "ticker" });
        }
        let (holder, stop_rx) = TickerHolder::new(interval);
        tickers.insert(activity, holder.clone());
        Ok((holder, stop_rx))
    }

    pub fn get_ticker(&self, activity: usize) -> Option<Arc<TickerHolder>> {
        self.tickers.lock().unwrap().get(&activity).cloned()
    }

    /// Cancels and unregisters the ticker. Idempotent.
    pub fn remove_ticker(&self, activity: usize) -> bool {
        match self.tickers.lock().unwrap().remove(&activity) {
            Some(holder) => {
                holder.stop();
                true
            }
            None => false,
        }
    }

    /// Registers a one-shot timer for `activity`. Fails when one already
    /// exists.
    pub fn new_timer(
        &self,
        activity: usize,
        interval: Duration,
    ) -> PipelineResult<(Arc<TimerHolder>, flume::Receiver<()>)> {
        let mut timers = self.timers.lock().unwrap();
        if timers.contains_key(&activity) {
            return Err(PipelineError::DuplicateTimer { kind: "timer" });
        }
        let (holder, stop_rx) = TimerHolder::new(interval);
        timers.insert(activity, holder.clone());
        Ok((holder, stop_rx))
    }

    pub fn get_timer(&self, activity: usize) -> Option<Arc<TimerHolder>> {
        self.timers.lock().unwrap().get(&activity).cloned()
    }

    /// Cancels and unregisters the timer. Idempotent.
    pub fn remove_timer(&self, activity: usize) -> bool {
        match self.timers.lock().unwrap().remove(&activity) {
            Some(holder) => {
                holder.stop();
                true
            }
            None => false,
        }
    }

    pub(crate) fn teardown(&self) {
        let mut tickers = self.tickers.lock().unwrap();
        for holder in tickers.values() {
            holder.stop();
        }
        tickers.clear();

        let mut timers = self.timers.lock().unwrap();
        for holder in timers.values() {
            holder.stop();
        }
        timers.clear();
        debug!("state torn down, timers stopped");
    }
}

/// Holds a repeating alarm and the most recently bound execution context.
///
/// A tick takes and clears the context, so a fire with nothing bound is a
/// no-op until a later event stalls and rebinds.
pub struct TickerHolder {
    interval: Duration,
    ctx: Mutex<Option<ExecutionContext>>,
    stop_tx: flume::Sender<()>,
}

impl std::fmt::Debug for TickerHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerHolder")
            .field("interval", &self.interval)
            .field("bound", &self.ctx.lock().unwrap().is_some())
            .finish()
    }
}

impl TickerHolder {
    fn new(interval: Duration) -> (Arc<Self>, flume::Receiver<()>) {
        let (stop_tx, stop_rx) = flume::bounded(1);
        (
            Arc::new(Self {
                interval,
                ctx: Mutex::new(None),
                stop_tx,
            }),
            stop_rx,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rebinds the context a future tick will resume.
    pub fn bind(&self, ctx: ExecutionContext) {
        *self.ctx.lock().unwrap() = Some(ctx);
    }

    /// Takes the bound context, leaving the slot empty.
    pub fn take(&self) -> Option<ExecutionContext> {
        self.ctx.lock().unwrap().take()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Holds a one-shot alarm and the context it will resume when it fires.
pub struct TimerHolder {
    interval: Duration,
    ctx: Mutex<Option<ExecutionContext>>,
    stop_tx: flume::Sender<()>,
}

impl std::fmt::Debug for TimerHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHolder")
            .field("interval", &self.interval)
            .field("bound", &self.ctx.lock().unwrap().is_some())
            .finish()
    }
}

impl TimerHolder {
    fn new(interval: Duration) -> (Arc<Self>, flume::Receiver<()>) {
        let (stop_tx, stop_rx) = flume::bounded(1);
        (
            Arc::new(Self {
                interval,
                ctx: Mutex::new(None),
                stop_tx,
            }),
            stop_rx,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn bind(&self, ctx: ExecutionContext) {
        *self.ctx.lock().unwrap() = Some(ctx);
    }

    pub fn take(&self) -> Option<ExecutionContext> {
        self.ctx.lock().unwrap().take()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

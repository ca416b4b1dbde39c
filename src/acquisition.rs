//! Periodic polling of every configured channel on one background thread.
//!
//! The cycle thread owns the data source and is the only writer of the
//! channel buffers. Each tick it polls the channels in ascending order, then
//! sleeps for whatever is left of the poll interval. Readers get
//! [`ChannelReader`]s and never block the cycle for longer than one copy.
//!
//! Observers are invoked synchronously on the cycle thread, so they must not
//! block for long and must not call [`Acquisition::stop`]. To end the cycle
//! from an observer, use a [`StopHandle`], which only requests the stop.
//!
//! ```no_run
//! use grating_qc_lib::{acquisition::{Acquisition, LoggingObserver}, settings::{KeyValueSettings, SettingsSnapshot}};
//!
//! fn main() -> Result<(), grating_qc_lib::error::Error> {
//!     let snapshot = SettingsSnapshot::capture(&KeyValueSettings::new());
//!     let mut acquisition = Acquisition::initialize(snapshot)?;
//!     acquisition.set_observer(LoggingObserver)?;
//!     acquisition.start()?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     acquisition.stop();
//!     Ok(())
//! }
//! ```

use crate::{
    channel::{Channel, ChannelReader, ChannelStore, DataSource},
    error::{Error, Result},
    measurement::{Measurement, Parameter},
    quality::{CapabilityLevel, QualityEngine},
    settings::SettingsSnapshot,
    simulator::Simulator,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of recent samples the capability check runs on.
pub const CAPABILITY_WINDOW: usize = 25;
/// Capability is not judged on fewer samples than this.
pub const MIN_CAPABILITY_SAMPLES: usize = 10;

/// Receives the results of the cycle, on the cycle thread.
pub trait AcquisitionObserver: Send {
    fn on_measurement(&mut self, channel: Channel, data: &Measurement);
    fn on_alarm(&mut self, message: &str);
}

/// Writes measurements at debug level and alarms at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl AcquisitionObserver for LoggingObserver {
    fn on_measurement(&mut self, channel: Channel, data: &Measurement) {
        log::debug!("Channel {channel}: {data}");
    }

    fn on_alarm(&mut self, message: &str) {
        log::warn!("{message}");
    }
}

/// Requests the cycle to stop without waiting for it.
#[derive(Debug, Clone)]
pub struct StopHandle(Sender<()>);

impl StopHandle {
    pub fn request_stop(&self) {
        // An error only means the cycle is already gone.
        let _ = self.0.send(());
    }
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Where results of a poll go: the observer, then the quality engine.
#[derive(Default)]
struct Dispatch {
    observer: Option<Box<dyn AcquisitionObserver>>,
    quality: Option<Arc<Mutex<QualityEngine>>>,
    levels: HashMap<(Channel, Parameter), CapabilityLevel>,
}

impl Dispatch {
    fn alarm(&mut self, message: &str) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_alarm(message);
        }
    }

    fn measurement(&mut self, store: &ChannelStore, measurement: &Measurement) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_measurement(store.channel(), measurement);
        }
        for alarm in store.check_alarms() {
            self.alarm(&alarm.to_string());
        }
        self.capability(store);
    }

    /// Refreshes the channel's statistics and reports parameters whose capability got worse.
    fn capability(&mut self, store: &ChannelStore) {
        let Some(quality) = self.quality.as_ref() else {
            return;
        };
        let channel = store.channel();
        let history = store.history(CAPABILITY_WINDOW);
        let mut messages = Vec::new();
        {
            let mut engine = quality.lock().unwrap_or_else(PoisonError::into_inner);
            for parameter in Parameter::ALL {
                let values: Vec<f64> = history.iter().map(|m| m.avg(parameter)).collect();
                let stats = engine.update_statistics(channel, parameter, &values);
                // Without spread Cpk is undefined and reported as 0.
                if stats.sample_count < MIN_CAPABILITY_SAMPLES
                    || stats.stddev == 0.0
                    || !engine.limits(parameter).is_configured()
                {
                    continue;
                }
                let level = engine.capability_level(parameter, stats.cpk);
                let previous = self
                    .levels
                    .insert((channel, parameter), level)
                    .unwrap_or(CapabilityLevel::Capable);
                if level > previous {
                    messages.push(format!(
                        "Channel {channel} {parameter} capability {level} (Cpk {:.3})",
                        stats.cpk
                    ));
                }
            }
        }
        for message in messages {
            self.alarm(&message);
        }
    }
}

/// State moved onto the cycle thread and handed back when it ends.
struct Cycle {
    source: DataSource,
    stores: BTreeMap<Channel, ChannelStore>,
    interval: Duration,
    dispatch: Dispatch,
}

impl Cycle {
    fn run(mut self, stop: Receiver<()>) -> Self {
        loop {
            let started = Instant::now();
            if self.poll_all(&|| stop_requested(&stop)).is_none() {
                break;
            }
            let remaining = self.interval.saturating_sub(started.elapsed());
            match stop.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self
    }

    /// Polls every channel once and returns how many produced a sample.
    ///
    /// `None` if a stop was requested before all channels were polled.
    fn poll_all(&mut self, should_stop: &dyn Fn() -> bool) -> Option<usize> {
        let mut produced = 0;
        for store in self.stores.values() {
            if should_stop() {
                return None;
            }
            match store.poll(&mut self.source) {
                Ok(measurement) => {
                    produced += 1;
                    self.dispatch.measurement(store, &measurement);
                }
                Err(no_data) => log::debug!("{no_data}; skipped this cycle"),
            }
        }
        Some(produced)
    }
}

struct Worker {
    handle: JoinHandle<Cycle>,
    stop: StopHandle,
}

/// The polling scheduler: `Idle` until [`start`](Acquisition::start), `Running` until [`stop`](Acquisition::stop).
pub struct Acquisition {
    readers: BTreeMap<Channel, ChannelReader>,
    interval: Duration,
    simulated: bool,
    // Present while idle.
    cycle: Option<Cycle>,
    // Present while running.
    worker: Option<Worker>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("channels", &self.channels())
            .field("interval", &self.interval)
            .field("simulated", &self.simulated)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Acquisition {
    /// Opens the link and sets up every channel of `snapshot`.
    ///
    /// A link that cannot be opened is not an error: the channels then produce simulated data.
    ///
    /// # Errors
    ///
    /// [`Error::NoChannels`] if `snapshot` has no usable channel.
    pub fn initialize(snapshot: SettingsSnapshot) -> Result<Self> {
        if snapshot.channels.is_empty() {
            return Err(Error::NoChannels);
        }
        let com = &snapshot.com;
        let source = DataSource::open(
            &com.device_name(),
            com.baud_rate,
            com.link_options(),
            Simulator::from_limits(&snapshot.limits),
        );
        let stores = snapshot
            .channels
            .into_iter()
            .map(|(channel, config)| ChannelStore::new(channel, config));
        Self::new(source, stores, snapshot.poll_interval)
    }

    /// Builds an idle scheduler over already constructed channels.
    pub fn new(
        source: DataSource,
        stores: impl IntoIterator<Item = ChannelStore>,
        interval: Duration,
    ) -> Result<Self> {
        let stores: BTreeMap<Channel, ChannelStore> = stores
            .into_iter()
            .map(|store| (store.channel(), store))
            .collect();
        if stores.is_empty() {
            return Err(Error::NoChannels);
        }
        let readers = stores
            .iter()
            .map(|(channel, store)| (*channel, store.reader()))
            .collect();
        Ok(Self {
            readers,
            interval,
            simulated: source.is_simulated(),
            cycle: Some(Cycle {
                source,
                stores,
                interval,
                dispatch: Dispatch::default(),
            }),
            worker: None,
        })
    }

    fn idle_cycle(&mut self) -> Result<&mut Cycle> {
        self.reap();
        if self.worker.is_some() {
            return Err(Error::Running);
        }
        self.cycle.as_mut().ok_or(Error::CycleUnavailable)
    }

    /// Sets the observer of measurements and alarms.
    ///
    /// # Errors
    ///
    /// [`Error::Running`] while the cycle runs.
    pub fn set_observer(&mut self, observer: impl AcquisitionObserver + 'static) -> Result<()> {
        self.idle_cycle()?.dispatch.observer = Some(Box::new(observer));
        Ok(())
    }

    /// Attaches a quality engine; the cycle then keeps its statistics current and raises capability alarms.
    ///
    /// # Errors
    ///
    /// [`Error::Running`] while the cycle runs.
    pub fn set_quality_engine(&mut self, engine: Arc<Mutex<QualityEngine>>) -> Result<()> {
        self.idle_cycle()?.dispatch.quality = Some(engine);
        Ok(())
    }

    /// Launches the cycle thread. Does nothing if it already runs.
    ///
    /// Capability levels are judged afresh on every start, so a parameter that
    /// is still degraded raises its alarm again.
    pub fn start(&mut self) -> Result<()> {
        self.reap();
        if self.worker.is_some() {
            return Ok(());
        }
        let mut cycle = self.cycle.take().ok_or(Error::CycleUnavailable)?;
        cycle.dispatch.levels.clear();
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || cycle.run(receiver))
            .map_err(Error::Spawn)?;
        self.worker = Some(Worker {
            handle,
            stop: StopHandle(sender),
        });
        log::info!(
            "Acquisition started: {} channel(s) every {:?}{}",
            self.readers.len(),
            self.interval,
            if self.simulated { " (simulated)" } else { "" }
        );
        Ok(())
    }

    /// Stops the cycle and waits for its thread to exit. Safe to call when idle.
    ///
    /// Called on the cycle thread itself, this only requests the stop.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.request_stop();
        if worker.handle.thread().id() == thread::current().id() {
            self.worker = Some(worker);
            return;
        }
        self.join(worker);
        log::info!("Acquisition stopped");
    }

    fn join(&mut self, worker: Worker) {
        match worker.handle.join() {
            Ok(cycle) => self.cycle = Some(cycle),
            Err(_) => log::error!("The acquisition thread panicked"),
        }
    }

    /// Collects a cycle thread that ended on a stop request from a [`StopHandle`].
    fn reap(&mut self) {
        if self
            .worker
            .as_ref()
            .is_some_and(|worker| worker.handle.is_finished())
        {
            if let Some(worker) = self.worker.take() {
                self.join(worker);
            }
        }
    }

    /// A handle to request the stop from elsewhere, while running.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.worker.as_ref().map(|worker| worker.stop.clone())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Polls every channel once on the calling thread, dispatching like the cycle does.
    ///
    /// Returns the number of channels that produced a sample.
    ///
    /// # Errors
    ///
    /// [`Error::Running`] while the cycle runs.
    pub fn poll_once(&mut self) -> Result<usize> {
        Ok(self.idle_cycle()?.poll_all(&|| false).unwrap_or_default())
    }

    pub fn channel(&self, channel: Channel) -> Option<ChannelReader> {
        self.readers.get(&channel).cloned()
    }

    /// Active channels in polling order.
    pub fn channels(&self) -> Vec<Channel> {
        self.readers.keys().copied().collect()
    }

    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

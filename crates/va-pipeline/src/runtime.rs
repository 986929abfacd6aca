//! Threaded runtime: one worker per area plus the PV-driver worker.
//!
//! Areas are chained in list order: the downstream neighbour of area `i`
//! is area `i + 1`. Every computed value travels to the driver worker,
//! the only writer of the PV database. Shutdown raises a shared stop flag;
//! workers then meet at a barrier, discard whatever is still queued and
//! meet again before their queues are released. A worker that fails or
//! panics raises the stop flag itself and still takes part in the teardown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use va_core::{Clock, ErrorInfo, PvValue, VaError};
use va_optics::OpticsEngine;
use va_stage::{FluctuationTable, MachineConfig, StageController};

use crate::area::{Area, AreaOutput, StageArea};
use crate::driver::{PvDatabase, PvReader};
use crate::messages::{DriverMessage, StageMessage};
use crate::timing::{CycleTiming, CYCLE_DEVICE};

/// Default processing interval of every worker.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

fn channel_closed(worker: &str, channel: &str) -> VaError {
    VaError::Transport(
        ErrorInfo::new("channel-closed", "a peer dropped its end of a queue")
            .with_context("worker", worker)
            .with_context("channel", channel),
    )
}

/// Timing area followed by one area per stage of `machine`, in beam order.
pub fn machine_areas(
    machine: &MachineConfig,
    mut engine: impl FnMut() -> Box<dyn OpticsEngine>,
    clock: Arc<dyn Clock>,
) -> Result<Vec<Box<dyn Area>>, VaError> {
    machine.validate()?;
    let mut areas: Vec<Box<dyn Area>> = vec![Box::new(CycleTiming::for_machine(machine))];
    for config in &machine.stages {
        let stage = StageController::new(config.clone(), engine(), Arc::clone(&clock))?;
        areas.push(Box::new(StageArea::new(stage)));
    }
    Ok(areas)
}

/// Sending half for client writes; cheap to clone.
#[derive(Debug, Clone)]
pub struct PvClient {
    driver: Sender<DriverMessage>,
    reader: PvReader,
}

impl PvClient {
    /// Queues a client write. Rejections are logged by the driver.
    pub fn write(&self, pv: &str, value: PvValue) -> Result<(), VaError> {
        self.send(DriverMessage::ClientWrite {
            pv: pv.to_string(),
            value,
        })
    }

    /// Pulses `AS-Glob:TI-Cycle:Start-Cmd`.
    pub fn start_cycle(&self) -> Result<(), VaError> {
        self.write(&format!("{CYCLE_DEVICE}:Start-Cmd"), PvValue::Scalar(1.0))
    }

    /// Queues an operator notice.
    pub fn alert(&self, text: impl Into<String>) -> Result<(), VaError> {
        self.send(DriverMessage::Alert(text.into()))
    }

    /// Current value of `pv`.
    pub fn get(&self, pv: &str) -> Option<PvValue> {
        self.reader.get(pv)
    }

    fn send(&self, message: DriverMessage) -> Result<(), VaError> {
        self.driver
            .send(message)
            .map_err(|_| channel_closed("client", "driver"))
    }
}

/// Running pipeline.
#[derive(Debug)]
pub struct Runtime {
    client: PvClient,
    stop: Arc<AtomicBool>,
    workers: Vec<(String, JoinHandle<Result<(), VaError>>)>,
}

impl Runtime {
    /// Seeds the PV database and spawns the workers.
    pub fn start(
        mut areas: Vec<Box<dyn Area>>,
        fluctuations: FluctuationTable,
        interval: Duration,
    ) -> Result<Self, VaError> {
        if areas.is_empty() {
            return Err(VaError::config("empty-pipeline", "runtime needs at least one area"));
        }
        let mut database = PvDatabase::new(fluctuations);
        for (route, area) in areas.iter_mut().enumerate() {
            let prefix = area.prefix().to_string();
            let initial = area.initial_values();
            database.register_area(route, &prefix, area.pv_table(), initial)?;
        }
        let reader = database.reader();

        let stop = Arc::new(AtomicBool::new(false));
        let (driver_tx, driver_rx) = mpsc::channel();
        let (inbox_tx, inbox_rx): (Vec<_>, Vec<_>) =
            areas.iter().map(|_| mpsc::channel::<StageMessage>()).unzip();

        let mut workers = Vec::with_capacity(areas.len() + 1);
        let mut gates = Vec::with_capacity(areas.len() + 1);
        let (gate, gate_rx) = mpsc::channel();
        gates.push(gate);
        let driver = DriverWorker {
            database,
            inbox: driver_rx,
            areas: inbox_tx.clone(),
            stop: Arc::clone(&stop),
            interval,
        };
        workers.push(spawn("va-driver".to_string(), move || driver.run(gate_rx))?);

        for (idx, (area, inbox)) in areas.into_iter().zip(inbox_rx).enumerate() {
            let name = format!("va-{}", area.prefix());
            let worker = AreaWorker {
                name: name.clone(),
                area,
                inbox,
                downstream: inbox_tx.get(idx + 1).cloned(),
                driver: driver_tx.clone(),
                stop: Arc::clone(&stop),
                interval,
            };
            let (gate, gate_rx) = mpsc::channel();
            match spawn(name, move || worker.run(gate_rx)) {
                Ok(handle) => {
                    workers.push(handle);
                    gates.push(gate);
                }
                Err(err) => {
                    // closing the gates lets the spawned workers return without serving
                    stop.store(true, Ordering::Release);
                    drop(gates);
                    for (name, handle) in workers {
                        if handle.join().is_err() {
                            warn!(worker = %name, "worker panicked while aborting start");
                        }
                    }
                    return Err(err);
                }
            }
        }

        let barrier = Arc::new(Barrier::new(workers.len()));
        for gate in gates {
            // a worker only drops its gate by exiting, which join reports
            let _ = gate.send(Arc::clone(&barrier));
        }
        info!(workers = workers.len(), interval_ms = interval.as_millis() as u64, "runtime started");

        Ok(Self {
            client: PvClient {
                driver: driver_tx,
                reader,
            },
            stop,
            workers,
        })
    }

    /// Builds the areas of `machine` and starts them.
    pub fn from_machine(
        machine: &MachineConfig,
        engine: impl FnMut() -> Box<dyn OpticsEngine>,
        clock: Arc<dyn Clock>,
        fluctuations: FluctuationTable,
        interval: Duration,
    ) -> Result<Self, VaError> {
        Self::start(machine_areas(machine, engine, clock)?, fluctuations, interval)
    }

    /// Handle for client writes and reads.
    pub fn client(&self) -> PvClient {
        self.client.clone()
    }

    /// Read-only view of the PV database.
    pub fn reader(&self) -> PvReader {
        self.client.reader.clone()
    }

    /// Queues a client write.
    pub fn write(&self, pv: &str, value: PvValue) -> Result<(), VaError> {
        self.client.write(pv, value)
    }

    /// Returns `true` once any worker has raised the stop flag.
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stops every worker and returns the first worker error.
    pub fn shutdown(mut self) -> Result<(), VaError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), VaError> {
        self.stop.store(true, Ordering::Release);
        let mut first = Ok(());
        for (name, handle) in self.workers.drain(..) {
            let result = handle.join().unwrap_or_else(|_| {
                Err(VaError::Transport(
                    ErrorInfo::new("worker-panicked", "worker thread panicked")
                        .with_context("worker", name.clone()),
                ))
            });
            if let Err(err) = result {
                error!(worker = %name, error = %err, "worker failed");
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        info!("runtime stopped");
        first
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.stop_and_join();
        }
    }
}

fn spawn(
    name: String,
    body: impl FnOnce() -> Result<(), VaError> + Send + 'static,
) -> Result<(String, JoinHandle<Result<(), VaError>>), VaError> {
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|err| {
            VaError::Transport(
                ErrorInfo::new("worker-spawn", err.to_string()).with_context("worker", name.clone()),
            )
        })?;
    Ok((name, handle))
}

/// Runs `serve`, turning an error or a panic into a pipeline stop.
fn guarded(
    name: &str,
    stop: &AtomicBool,
    serve: impl FnOnce() -> Result<(), VaError>,
) -> Result<(), VaError> {
    let result = panic::catch_unwind(AssertUnwindSafe(serve)).unwrap_or_else(|_| {
        Err(VaError::Transport(
            ErrorInfo::new("worker-panicked", "worker thread panicked").with_context("worker", name),
        ))
    });
    if let Err(err) = &result {
        error!(worker = name, error = %err, "worker stopping the pipeline");
        stop.store(true, Ordering::Release);
    }
    result
}

/// Two-phase teardown shared by every worker.
fn release<T>(name: &str, inbox: &Receiver<T>, barrier: &Barrier) {
    barrier.wait();
    let mut discarded = 0usize;
    while inbox.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(worker = name, discarded, "queue drained on shutdown");
    }
    barrier.wait();
}

struct AreaWorker {
    name: String,
    area: Box<dyn Area>,
    inbox: Receiver<StageMessage>,
    downstream: Option<Sender<StageMessage>>,
    driver: Sender<DriverMessage>,
    stop: Arc<AtomicBool>,
    interval: Duration,
}

impl AreaWorker {
    fn run(mut self, gate: Receiver<Arc<Barrier>>) -> Result<(), VaError> {
        let Ok(barrier) = gate.recv() else {
            return Ok(());
        };
        debug!(worker = %self.name, "area worker started");
        let name = self.name.clone();
        let stop = Arc::clone(&self.stop);
        let result = guarded(&name, &stop, || self.serve());
        release(&self.name, &self.inbox, &barrier);
        result
    }

    fn serve(&mut self) -> Result<(), VaError> {
        while !self.stop.load(Ordering::Acquire) {
            let tick = Instant::now();
            let deadline = tick + self.interval / 2;
            while let Some(budget) = deadline.checked_duration_since(Instant::now()) {
                match self.inbox.recv_timeout(budget) {
                    Ok(message) => {
                        if let Err(err) = self.area.handle(message) {
                            error!(worker = %self.name, error = %err, "message failed");
                        }
                        self.route()?;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(channel_closed(&self.name, "inbox"))
                    }
                }
            }
            self.area.update_state();
            self.route()?;
            if let Some(rest) = (tick + self.interval).checked_duration_since(Instant::now()) {
                thread::sleep(rest);
            }
        }
        Ok(())
    }

    fn route(&mut self) -> Result<(), VaError> {
        for output in self.area.take_outputs() {
            match output {
                AreaOutput::Push { pv, value } => self
                    .driver
                    .send(DriverMessage::Update { pv, value })
                    .map_err(|_| channel_closed(&self.name, "driver"))?,
                AreaOutput::Downstream(message) => match &self.downstream {
                    Some(next) => next
                        .send(message)
                        .map_err(|_| channel_closed(&self.name, "downstream"))?,
                    None => debug!(worker = %self.name, "no downstream area, message dropped"),
                },
            }
        }
        Ok(())
    }
}

struct DriverWorker {
    database: PvDatabase,
    inbox: Receiver<DriverMessage>,
    areas: Vec<Sender<StageMessage>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
}

impl DriverWorker {
    fn run(mut self, gate: Receiver<Arc<Barrier>>) -> Result<(), VaError> {
        let Ok(barrier) = gate.recv() else {
            return Ok(());
        };
        let stop = Arc::clone(&self.stop);
        let result = guarded("va-driver", &stop, || self.serve());
        release("va-driver", &self.inbox, &barrier);
        result
    }

    fn serve(&mut self) -> Result<(), VaError> {
        while !self.stop.load(Ordering::Acquire) {
            match self.inbox.recv_timeout(self.interval) {
                Ok(message) => self.handle(message)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(channel_closed("va-driver", "inbox"))
                }
            }
        }
        Ok(())
    }

    fn handle(&mut self, message: DriverMessage) -> Result<(), VaError> {
        match message {
            DriverMessage::Update { pv, value } => self.database.apply_update(&pv, value),
            DriverMessage::ClientWrite { pv, value } => {
                match self.database.client_write(&pv, value.clone()) {
                    Ok(route) => self.areas[route]
                        .send(StageMessage::SetParameter { pv, value })
                        .map_err(|_| channel_closed("va-driver", "area"))?,
                    Err(err) => warn!(pv = %pv, error = %err, "client write rejected"),
                }
            }
            DriverMessage::Alert(text) => warn!(alert = %text, "operator alert"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use va_stage::TimingConfig;

    fn timing_worker(
        downstream: Option<Sender<StageMessage>>,
        driver: Sender<DriverMessage>,
    ) -> (AreaWorker, Sender<StageMessage>, Arc<AtomicBool>) {
        let (inbox_tx, inbox) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = AreaWorker {
            name: "va-AS".to_string(),
            area: Box::new(CycleTiming::new(&TimingConfig::default())),
            inbox,
            downstream,
            driver,
            stop: Arc::clone(&stop),
            interval: Duration::from_millis(5),
        };
        (worker, inbox_tx, stop)
    }

    fn run_with_timeout(worker: AreaWorker) -> Result<(), VaError> {
        let (gate, gate_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(worker.run(gate_rx));
        });
        gate.send(Arc::new(Barrier::new(1))).expect("gate");
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker finished")
    }

    #[test]
    fn closed_downstream_queue_stops_the_pipeline() {
        let (downstream, downstream_rx) = mpsc::channel();
        let (driver, _driver_rx) = mpsc::channel();
        let (worker, inbox, stop) = timing_worker(Some(downstream), driver);
        drop(downstream_rx);
        inbox
            .send(StageMessage::SetParameter {
                pv: format!("{CYCLE_DEVICE}:Start-Cmd"),
                value: PvValue::Scalar(1.0),
            })
            .expect("queued");

        let err = run_with_timeout(worker).expect_err("transport failure");
        assert_eq!(err.info().code, "channel-closed");
        assert_eq!(err.info().context.get("channel").map(String::as_str), Some("downstream"));
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn closed_inbox_stops_the_pipeline() {
        let (driver, _driver_rx) = mpsc::channel();
        let (worker, inbox, stop) = timing_worker(None, driver);
        drop(inbox);

        let err = run_with_timeout(worker).expect_err("transport failure");
        assert_eq!(err.info().code, "channel-closed");
        assert_eq!(err.info().context.get("channel").map(String::as_str), Some("inbox"));
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn closed_gate_skips_serving() {
        let (driver, _driver_rx) = mpsc::channel();
        let (worker, _inbox, stop) = timing_worker(None, driver);
        let (gate, gate_rx) = mpsc::channel::<Arc<Barrier>>();
        drop(gate);
        worker.run(gate_rx).expect("aborted start is not an error");
        assert!(!stop.load(Ordering::Acquire));
    }
}

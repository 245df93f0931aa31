//! Estimation worker and transform broadcaster threads.
//!
//! The estimation worker owns the [`UpdateController`]. It repeatedly moves the latest scan (and any pose
//! seed) out of the shared [`ControllerInbox`], runs one controller step, and idles for
//! `poll_interval_ms`. At most one filter cycle runs at a time.
//!
//! The broadcaster runs on its own fixed cadence, reading only the [`SharedEstimate`]. Every
//! `broadcast_interval_ms` it hands the latest map→odom correction, stamped `transform_postdate_ms` past
//! the last scan, to a caller-provided sink. It never touches the particle cloud.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::Pose2D;
use crate::config::RuntimeConfig;
use crate::controller::{StepOutcome, UpdateController};
use crate::error::{LocalizationError, Result};
use crate::measurements::{MapDistance, RangeScan};
use crate::odometry::OdometrySource;
use crate::publish::{MapToOdom, Publisher, SharedEstimate};

/// Inputs waiting for the estimation worker. Each slot holds only the most recent value.
#[derive(Debug, Default)]
pub struct ControllerInbox {
    scan: Mutex<Option<RangeScan>>,
    seed: Mutex<Option<(Pose2D, DateTime<Utc>)>>,
    shared: SharedEstimate,
}

impl ControllerInbox {
    pub fn new(shared: SharedEstimate) -> Self {
        ControllerInbox {
            scan: Mutex::new(None),
            seed: Mutex::new(None),
            shared,
        }
    }

    /// Replaces any scan the worker has not picked up yet.
    pub fn submit_scan(&self, scan: RangeScan) -> Result<()> {
        self.shared.note_scan(scan.stamp)?;
        let mut slot = self
            .scan
            .lock()
            .map_err(|_| LocalizationError::LockPoisoned("scan inbox"))?;
        if let Some(previous) = slot.replace(scan) {
            log::debug!("Scan from {} superseded before processing", previous.stamp);
        }
        Ok(())
    }

    pub fn submit_initial_pose(&self, pose: Pose2D, stamp: DateTime<Utc>) -> Result<()> {
        pose.validate()?;
        let mut slot = self
            .seed
            .lock()
            .map_err(|_| LocalizationError::LockPoisoned("seed inbox"))?;
        *slot = Some((pose, stamp));
        Ok(())
    }

    fn take_scan(&self) -> Result<Option<RangeScan>> {
        Ok(self
            .scan
            .lock()
            .map_err(|_| LocalizationError::LockPoisoned("scan inbox"))?
            .take())
    }

    fn take_seed(&self) -> Result<Option<(Pose2D, DateTime<Utc>)>> {
        Ok(self
            .seed
            .lock()
            .map_err(|_| LocalizationError::LockPoisoned("seed inbox"))?
            .take())
    }
}

/// Handles to the running worker and broadcaster.
pub struct LocalizationRuntime<M, O, P> {
    running: Arc<AtomicBool>,
    inbox: Arc<ControllerInbox>,
    shared: SharedEstimate,
    worker: JoinHandle<UpdateController<M, O, P>>,
    broadcaster: JoinHandle<()>,
}

impl<M, O, P> LocalizationRuntime<M, O, P>
where
    M: MapDistance + Send + 'static,
    O: OdometrySource + 'static,
    P: Publisher + 'static,
{
    /// Moves `controller` onto the estimation worker and starts the broadcaster, which passes each
    /// correction to `sink`.
    pub fn start<F>(
        controller: UpdateController<M, O, P>,
        config: RuntimeConfig,
        sink: F,
    ) -> Result<Self>
    where
        F: FnMut(MapToOdom) + Send + 'static,
    {
        config.validate()?;
        let running = Arc::new(AtomicBool::new(true));
        let shared = controller.shared_estimate();
        let inbox = Arc::new(ControllerInbox::new(shared.clone()));

        let worker = {
            let running = Arc::clone(&running);
            let inbox = Arc::clone(&inbox);
            let poll = Duration::from_millis(config.poll_interval_ms);
            thread::Builder::new()
                .name("mcl-estimation".into())
                .spawn(move || run_estimation_loop(controller, &inbox, &running, poll))?
        };

        let broadcaster = {
            let keep_running = Arc::clone(&running);
            let shared = shared.clone();
            let interval = Duration::from_millis(config.broadcast_interval_ms);
            let postdate = TimeDelta::milliseconds(config.transform_postdate_ms);
            let spawned = thread::Builder::new()
                .name("mcl-broadcast".into())
                .spawn(move || run_broadcast_loop(&shared, &keep_running, interval, postdate, sink));
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    running.store(false, Ordering::Release);
                    return Err(e.into());
                }
            }
        };

        log::info!(
            "Localization runtime started (poll {} ms, broadcast {} ms)",
            config.poll_interval_ms,
            config.broadcast_interval_ms
        );
        Ok(LocalizationRuntime {
            running,
            inbox,
            shared,
            worker,
            broadcaster,
        })
    }

    /// Where producers drop scans and pose seeds.
    pub fn inbox(&self) -> Arc<ControllerInbox> {
        Arc::clone(&self.inbox)
    }

    pub fn shared_estimate(&self) -> SharedEstimate {
        self.shared.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops both threads and hands the controller back.
    pub fn shutdown(self) -> Result<UpdateController<M, O, P>> {
        self.running.store(false, Ordering::Release);
        let broadcaster = self.broadcaster.join();
        let controller = self
            .worker
            .join()
            .map_err(|_| LocalizationError::ThreadPanicked("estimation"))?;
        broadcaster.map_err(|_| LocalizationError::ThreadPanicked("broadcast"))?;
        log::info!(
            "Localization runtime stopped after {} filter cycles",
            controller.cycles()
        );
        Ok(controller)
    }
}

fn run_estimation_loop<M, O, P>(
    mut controller: UpdateController<M, O, P>,
    inbox: &ControllerInbox,
    running: &AtomicBool,
    poll: Duration,
) -> UpdateController<M, O, P>
where
    M: MapDistance,
    O: OdometrySource,
    P: Publisher,
{
    while running.load(Ordering::Acquire) {
        if let Err(e) = forward_inputs(&mut controller, inbox) {
            log::error!("Estimation worker could not read its inbox: {e}");
            break;
        }
        match controller.step() {
            Ok(StepOutcome::Idle) => {}
            Ok(outcome) => log::trace!("Estimation step: {outcome:?}"),
            Err(e) => log::error!("Estimation step failed: {e}"),
        }
        thread::sleep(poll);
    }
    controller
}

fn forward_inputs<M, O, P>(
    controller: &mut UpdateController<M, O, P>,
    inbox: &ControllerInbox,
) -> Result<()>
where
    M: MapDistance,
    O: OdometrySource,
    P: Publisher,
{
    if let Some((pose, stamp)) = inbox.take_seed()?
        && let Err(e) = controller.set_initial_pose(pose, stamp)
    {
        log::warn!("Ignoring initial pose {pose}: {e}");
    }
    if let Some(scan) = inbox.take_scan()? {
        controller.submit_scan(scan)?;
    }
    Ok(())
}

fn run_broadcast_loop<F>(
    shared: &SharedEstimate,
    running: &AtomicBool,
    interval: Duration,
    postdate: TimeDelta,
    mut sink: F,
) where
    F: FnMut(MapToOdom),
{
    while running.load(Ordering::Acquire) {
        match shared.postdated_correction(postdate) {
            Ok(Some(correction)) => sink(correction),
            Ok(None) => {}
            Err(e) => {
                log::error!("Transform broadcaster stopping: {e}");
                break;
            }
        }
        thread::sleep(interval);
    }
}

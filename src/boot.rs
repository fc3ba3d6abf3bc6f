//! Boot sequence: everything between `main` and the retry loop.
//!
//! # Order
//!
//! 1. Take the single-instance lease. A live owner aborts here, before any
//!    hardware is opened.
//! 2. Open the LED rig and build the feedback handler (`BootStarting`).
//! 3. Bring up the speaker: blocking recovery with fallback to a background
//!    thread, or background only, per `bluetooth.strategy`.
//! 4. Restart usbmuxd.
//! 5. Run the [`Orchestrator`] until success, exhaustion or interrupt.
//!
//! Each acquired resource is registered with one shared [`Teardown`], so
//! every exit path releases the same things in reverse order: stray
//! processes, usbmuxd, background players, background recovery, speaker
//! power, LEDs, lease.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::audio::{sink, AudioOutput, Mpg123Player, SilentAudio};
use crate::automation::{
    Orchestrator, PatternTable, PtySpawner, RetryPolicy, RunSummary, SharedPhase, StateMachine,
    ToolSpawner,
};
use crate::bluetooth::{
    recover_blocking, BackgroundRecovery, BluetoothControl, BluetoothCtl, RecoveryPolicy,
};
use crate::cancel::CancelToken;
use crate::config::{
    AppConfig, AudioConfig, BluetoothConfig, BtStrategy, LedConfig, SystemConfig, ToolConfig,
};
use crate::feedback::{CueTimings, Feedback, FeedbackEvent, StatusFeedback};
use crate::lease::{LeaseError, PidLease, ProcFs, ProcessTable};
use crate::led::{LedRig, LineError};
use crate::system::{self, CommandShutdown, Shutdown, Teardown, Usbmuxd};

/// How long teardown waits for the background recovery thread.
const RECOVERY_STOP_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("status LEDs unavailable: {0}")]
    Leds(#[from] LineError),
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Everything the boot sequence acquires from the host.
pub trait Platform: Send + Sync {
    fn processes(&self) -> &dyn ProcessTable;

    /// `None` runs without LED feedback.
    fn open_leds(&self, cfg: &LedConfig) -> Result<Option<Arc<LedRig>>, LineError>;

    fn audio(&self, cfg: &AudioConfig) -> Arc<dyn AudioOutput>;

    fn bluetooth(&self, cfg: &BluetoothConfig) -> Arc<dyn BluetoothControl>;

    /// Wait for the speaker's audio sink and set the output volume.
    /// Returns whether the sink appeared.
    fn prepare_sink(&self, cfg: &AudioConfig, cancel: &CancelToken) -> bool;

    /// Restart usbmuxd. The returned closure stops it again.
    fn start_usbmuxd(&self, cfg: &SystemConfig) -> Option<Box<dyn FnOnce() + Send>>;

    fn reap(&self, names: &[String]);

    fn spawner(&self, cfg: &ToolConfig) -> Arc<dyn ToolSpawner>;

    fn shutdown(&self, cfg: &SystemConfig) -> Arc<dyn Shutdown>;
}

/// The real machine: procfs, GPIO, mpg123, bluetoothctl, a PTY.
#[derive(Debug, Default)]
pub struct HostPlatform {
    procfs: ProcFs,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for HostPlatform {
    fn processes(&self) -> &dyn ProcessTable {
        &self.procfs
    }

    fn open_leds(&self, cfg: &LedConfig) -> Result<Option<Arc<LedRig>>, LineError> {
        LedRig::open(cfg).map(|rig| Some(Arc::new(rig)))
    }

    fn audio(&self, cfg: &AudioConfig) -> Arc<dyn AudioOutput> {
        if cfg.enabled {
            Arc::new(Mpg123Player::new(cfg))
        } else {
            log::info!("[audio] disabled in config");
            Arc::new(SilentAudio)
        }
    }

    fn bluetooth(&self, cfg: &BluetoothConfig) -> Arc<dyn BluetoothControl> {
        Arc::new(BluetoothCtl::new(cfg))
    }

    fn prepare_sink(&self, cfg: &AudioConfig, cancel: &CancelToken) -> bool {
        let server = cfg.pulse_server.as_deref();
        let wait = Duration::from_secs_f32(cfg.sink_wait_secs.max(0.0));
        let found = sink::wait_for_sink(server, wait, cancel);
        sink::set_volume(server, cfg.volume_percent);
        found
    }

    fn start_usbmuxd(&self, cfg: &SystemConfig) -> Option<Box<dyn FnOnce() + Send>> {
        match Usbmuxd::restart(cfg) {
            Ok(usbmuxd) => Some(Box::new(move || usbmuxd.stop())),
            Err(e) => {
                log::error!("[usb] {e}; continuing without a fresh usbmuxd");
                None
            }
        }
    }

    fn reap(&self, names: &[String]) {
        system::reap(names);
    }

    fn spawner(&self, cfg: &ToolConfig) -> Arc<dyn ToolSpawner> {
        Arc::new(PtySpawner::new(cfg))
    }

    fn shutdown(&self, cfg: &SystemConfig) -> Arc<dyn Shutdown> {
        Arc::new(CommandShutdown::new(cfg))
    }
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Run the whole boot sequence. Returns once the run has reached a terminal
/// outcome and teardown has completed.
pub fn run(
    config: &AppConfig,
    platform: Arc<dyn Platform>,
    interrupt: CancelToken,
) -> Result<RunSummary, BootError> {
    log::info!("===== autorain boot sequence start =====");

    let lease = PidLease::acquire(
        &config.system.lease_file,
        &config.system.lease_marker,
        platform.processes(),
    )?;
    let teardown = Arc::new(Teardown::new());
    teardown.register("lease", move || {
        let mut lease = lease;
        lease.release();
    });

    let leds = platform.open_leds(&config.leds)?;
    if let Some(rig) = &leds {
        let rig = Arc::clone(rig);
        teardown.register("leds", move || rig.shutdown());
    }

    let audio = platform.audio(&config.audio);
    let feedback: Arc<dyn Feedback> = Arc::new(StatusFeedback::new(
        Arc::clone(&audio),
        leds,
        CueTimings::from_config(&config.tool),
        interrupt.clone(),
    ));
    feedback.emit(FeedbackEvent::BootStarting);

    connect_speaker(config, &platform, &feedback, &teardown, &interrupt);
    teardown.register("audio", move || audio.stop_all());

    if config.system.usbmuxd_enabled {
        if let Some(stop) = platform.start_usbmuxd(&config.system) {
            teardown.register("usbmuxd", stop);
        }
    }
    {
        let platform = Arc::clone(&platform);
        let names = config.system.reap_names.clone();
        teardown.register("reap", move || platform.reap(&names));
    }

    let machine = StateMachine::new(
        PatternTable::default(),
        Arc::clone(&feedback),
        config.tool.inactivity_timeout(),
        interrupt.clone(),
        SharedPhase::new(),
    );
    let orchestrator = Orchestrator::new(
        platform.spawner(&config.tool),
        machine,
        feedback,
        RetryPolicy::from(&config.retry),
        teardown,
        platform.shutdown(&config.system),
        interrupt,
    );
    Ok(orchestrator.run())
}

fn connect_speaker(
    config: &AppConfig,
    platform: &Arc<dyn Platform>,
    feedback: &Arc<dyn Feedback>,
    teardown: &Teardown,
    interrupt: &CancelToken,
) {
    let bt = &config.bluetooth;
    if !bt.enabled {
        log::info!("[bt] disabled in config");
        feedback.emit(FeedbackEvent::Ready);
        return;
    }

    let ctl = platform.bluetooth(bt);
    {
        let ctl = Arc::clone(&ctl);
        teardown.register("speaker", move || ctl.power_off());
    }
    feedback.emit(FeedbackEvent::SpeakerWaiting);

    if bt.strategy == BtStrategy::Blocking {
        let report = recover_blocking(ctl.as_ref(), &bt.device, &RecoveryPolicy::startup(bt), interrupt);
        log::info!(
            "[bt] startup recovery: {:?} after {:?} ({} power cycles)",
            report.outcome,
            report.elapsed,
            report.state.power_cycles()
        );
        if report.connected() {
            speaker_ready(platform.as_ref(), &config.audio, feedback.as_ref(), interrupt);
            return;
        }
        if interrupt.is_cancelled() {
            return;
        }
        log::warn!("[bt] continuing without audio; recovery moves to the background");
        feedback.emit(FeedbackEvent::SpeakerUnavailable);
    } else {
        feedback.emit(FeedbackEvent::Ready);
    }

    let on_connect = {
        let platform = Arc::clone(platform);
        let audio = config.audio.clone();
        let feedback = Arc::clone(feedback);
        move |stopped: &CancelToken| {
            speaker_ready(platform.as_ref(), &audio, feedback.as_ref(), stopped)
        }
    };
    match BackgroundRecovery::spawn(
        ctl,
        bt.device.clone(),
        RecoveryPolicy::background(bt),
        Duration::from_secs(bt.retry_interval_secs),
        on_connect,
    ) {
        Ok(mut recovery) => teardown.register("bt-recovery", move || {
            recovery.stop(RECOVERY_STOP_WAIT);
        }),
        Err(e) => log::error!("[bt] cannot start background recovery: {e}"),
    }
}

/// Wait for the sink, then announce the speaker. `cancel` is the interrupt
/// on the startup path and the recovery thread's own token in the
/// background, which teardown raises before the LEDs go dark.
fn speaker_ready(
    platform: &dyn Platform,
    audio: &AudioConfig,
    feedback: &dyn Feedback,
    cancel: &CancelToken,
) {
    if !platform.prepare_sink(audio, cancel) {
        log::warn!("[audio] no Bluetooth sink yet; cues may be lost");
    }
    if cancel.is_cancelled() {
        log::info!("[bt] speaker came up during shutdown; not announcing it");
        return;
    }
    feedback.emit(FeedbackEvent::SpeakerConnected);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! FrameLink core engine.
//! Captures frames from a live video source, encodes them at an adaptive
//! dual-tier policy, streams them to a remote inference service and reconciles
//! the annotated results it sends back.

pub mod channel;
pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod protocol;
pub mod reconciler;
pub mod scheduler;
pub mod status;
pub mod throughput;

use channel::{ChannelEvent, ChannelManager, ChannelState, SendStatus, Transport};
use config::ClientConfig;
use device::{DeviceCapability, StartupOutcome, VideoSourceManager};
use encoder::FrameEncoder;
use error::CoreResult;
use protocol::OutboundFrame;
use reconciler::{ApplyOutcome, ResultReconciler};
use scheduler::{CaptureScheduler, SkipReason, TickOutcome};
use status::{EngineStatus, ErrorSurfaces};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// User-facing controls accepted by [`LiveEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    SetTargetRate { hz: u32 },
    SelectDevice { device_id: String },
    RefreshDevices,
    ClearResults,
    Reconnect,
    Shutdown,
}

/// LiveEngine owns the video source, encoder, scheduler, channel and
/// reconciler of one client session and drives them from a single event loop.
pub struct LiveEngine<D, E>
where
    D: DeviceCapability,
    E: FrameEncoder,
{
    config: ClientConfig,
    video: VideoSourceManager<D>,
    encoder: E,
    scheduler: CaptureScheduler,
    reconciler: ResultReconciler,
    errors: ErrorSurfaces,
    channel: Option<ChannelManager>,
    status: watch::Sender<EngineStatus>,
}

impl<D, E> LiveEngine<D, E>
where
    D: DeviceCapability,
    E: FrameEncoder,
{
    /// Creates an idle engine. Fails if the encoding policy is invalid.
    pub fn new(capability: D, encoder: E, config: ClientConfig) -> CoreResult<Self> {
        let scheduler = CaptureScheduler::new(config.policy.clone(), config.backpressure)?
            .with_in_flight_timeout(Duration::from_millis(config.in_flight_timeout_ms));
        let reconciler = ResultReconciler::new(config.trailing_window, config.drop_stale_results);
        let video = VideoSourceManager::new(capability, config.constraints);
        let (status, _) = watch::channel(EngineStatus::default());

        let engine = Self {
            config,
            video,
            encoder,
            scheduler,
            reconciler,
            errors: ErrorSurfaces::default(),
            channel: None,
            status,
        };
        engine.publish_status();
        Ok(engine)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn video(&self) -> &VideoSourceManager<D> {
        &self.video
    }

    pub fn scheduler(&self) -> &CaptureScheduler {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &ResultReconciler {
        &self.reconciler
    }

    pub fn errors(&self) -> &ErrorSurfaces {
        &self.errors
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map_or(ChannelState::Closed, ChannelManager::state)
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Starts capture and the channel on independent lifecycles, then arms the
    /// scheduler. A running session is stopped first.
    pub async fn start<T: Transport>(&mut self, transport: T) {
        if self.channel.is_some() || self.video.has_session() {
            self.stop().await;
        }

        self.start_capture().await;
        self.channel = Some(ChannelManager::connect(
            transport,
            self.config.endpoint.clone(),
            self.config.channel.clone(),
        ));
        self.scheduler.arm(self.is_ready());
        self.publish_status();
    }

    async fn start_capture(&mut self) {
        match self.video.startup().await {
            StartupOutcome::Acquired => self.errors.clear_camera(),
            StartupOutcome::DefaultFallback { cause } => {
                tracing::warn!(
                    error = %cause,
                    "device selection unavailable, using default camera"
                );
                self.errors.set_camera(status::DEFAULT_CAMERA_MESSAGE);
            }
            StartupOutcome::Failed(err) => {
                tracing::error!(error = %err, "no camera could be opened");
                self.errors.set_camera(status::camera_message(&err));
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.video.has_session() && self.channel.as_ref().is_some_and(ChannelManager::is_open)
    }

    fn sync_readiness(&mut self) {
        let ready = self.is_ready();
        self.scheduler.update_readiness(ready);
    }

    /// Runs one capture cycle: grab, encode at the tick's tier, hand off.
    pub fn capture_tick(&mut self) -> TickOutcome {
        let now = Instant::now();
        self.scheduler.expire_in_flight(now);
        let plan = match self.scheduler.plan_tick(self.video.is_source_ready()) {
            Ok(plan) => plan,
            Err(reason) => return TickOutcome::Skipped(reason),
        };
        let Some(channel) = self.channel.as_ref().filter(|channel| channel.is_open()) else {
            return TickOutcome::Skipped(SkipReason::ChannelNotOpen);
        };
        let Some(frame) = self.video.grab_frame() else {
            return TickOutcome::Skipped(SkipReason::NoFrame);
        };

        let tier = self.scheduler.policy().tier(plan.tier);
        let payload = match self.encoder.encode(&frame, tier.resolution, tier.quality) {
            Ok(Some(payload)) => payload,
            Ok(None) => return TickOutcome::Skipped(SkipReason::NoFrame),
            Err(err) => {
                tracing::warn!(error = %err, sequence = plan.sequence, "frame encode failed");
                return TickOutcome::Skipped(SkipReason::EncodeFailed);
            }
        };

        let bytes = payload.len();
        let frame = OutboundFrame {
            sequence: plan.sequence,
            tier: plan.tier,
            payload,
        };
        match channel.send(frame) {
            SendStatus::Queued => {}
            SendStatus::NotOpen => return TickOutcome::Skipped(SkipReason::ChannelNotOpen),
            SendStatus::QueueFull => return TickOutcome::Skipped(SkipReason::QueueFull),
        }

        self.scheduler.complete_tick(now);
        TickOutcome::Sent {
            sequence: plan.sequence,
            tier: plan.tier,
            bytes,
        }
    }

    /// Waits for the next channel event and applies it. `None` once no channel is running.
    pub async fn handle_next_channel_event(&mut self) -> Option<ChannelEvent> {
        let event = self.channel.as_mut()?.next_event().await?;
        self.handle_channel_event(event.clone());
        self.publish_status();
        Some(event)
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connecting { attempt } => {
                tracing::debug!(attempt, "connecting to inference service");
            }
            ChannelEvent::Opened => {
                self.errors.clear_connection();
                self.scheduler.release_in_flight();
            }
            ChannelEvent::Closed { reason } => {
                tracing::info!(%reason, "inference channel closed");
                self.scheduler.release_in_flight();
            }
            ChannelEvent::Errored { detail } => {
                tracing::warn!(%detail, "inference channel error");
                self.errors
                    .set_connection(status::connection_failed_message(&self.config.endpoint));
                self.scheduler.release_in_flight();
            }
            ChannelEvent::ReconnectExhausted { attempts } => {
                self.errors
                    .set_connection(status::reconnect_exhausted_message(attempts));
            }
            ChannelEvent::MessageReceived(result) => {
                self.scheduler.release_in_flight();
                if let ApplyOutcome::Stale { sequence, displayed } =
                    self.reconciler.apply(result, Instant::now())
                {
                    tracing::debug!(sequence, displayed, "dropped stale result");
                }
            }
            ChannelEvent::ServiceError(message) => {
                tracing::warn!(%message, "inference service reported an error");
                self.scheduler.release_in_flight();
                self.reconciler.record_service_error(message);
            }
            ChannelEvent::FrameDropped { sequence } => {
                tracing::debug!(sequence, "frame never reached the service");
                self.scheduler.release_in_flight();
            }
        }
        self.sync_readiness();
    }

    /// Applies a user command. Returns whether the capture timer must be rebuilt.
    pub async fn handle_command(&mut self, command: EngineCommand) -> bool {
        let reschedule = match command {
            EngineCommand::SetTargetRate { hz } => match self.scheduler.set_target_rate(hz) {
                Ok(changed) => {
                    let period_ms = self.scheduler.period().as_millis() as u64;
                    tracing::info!(hz, period_ms, "target rate updated");
                    changed
                }
                Err(err) => {
                    tracing::warn!(error = %err, hz, "rejected target rate");
                    false
                }
            },
            EngineCommand::SelectDevice { device_id } => {
                let _ = self.select_device(&device_id).await;
                false
            }
            EngineCommand::RefreshDevices => {
                let _ = self.refresh_devices().await;
                false
            }
            EngineCommand::ClearResults => {
                self.reconciler.clear();
                false
            }
            EngineCommand::Reconnect => {
                match self.channel.as_ref() {
                    Some(channel) => {
                        if let Err(err) = channel.reconnect() {
                            tracing::warn!(error = %err, "manual reconnect failed");
                        }
                    }
                    None => tracing::warn!("manual reconnect requested without a channel"),
                }
                false
            }
            EngineCommand::Shutdown => {
                self.stop().await;
                false
            }
        };
        self.sync_readiness();
        self.publish_status();
        reschedule
    }

    /// Switches the capture device. The camera surface reports a failure.
    pub async fn select_device(&mut self, device_id: &str) -> CoreResult<()> {
        let result = self.video.switch_device(device_id).await;
        match &result {
            Ok(()) => self.errors.clear_camera(),
            Err(err) => {
                tracing::warn!(error = %err, "device switch failed");
                self.errors.set_camera(status::camera_message(err));
            }
        }
        self.sync_readiness();
        result
    }

    /// Re-enumerates devices, opening the first one if nothing is selected.
    pub async fn refresh_devices(&mut self) -> CoreResult<()> {
        let result = self.video.refresh_devices().await;
        match &result {
            Ok(()) if self.video.has_session() => self.errors.clear_camera(),
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, "device refresh failed");
                self.errors.set_camera(status::camera_message(err));
            }
        }
        self.sync_readiness();
        result
    }

    /// Event loop: capture ticks, channel events, throughput windows and
    /// commands. Returns after `Shutdown` or when the command sender is gone,
    /// with the engine stopped.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let mut ticker = self.scheduler.new_interval();
        let mut throughput = tokio::time::interval_at(
            Instant::now() + throughput::THROUGHPUT_WINDOW,
            throughput::THROUGHPUT_WINDOW,
        );
        throughput.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick(), if self.scheduler.is_running() => {
                    let outcome = self.capture_tick();
                    tracing::trace!(?outcome, "capture tick");
                }
                event = next_channel_event(&mut self.channel) => match event {
                    Some(event) => self.handle_channel_event(event),
                    None => {
                        tracing::warn!("channel driver stopped unexpectedly");
                        self.channel = None;
                        self.sync_readiness();
                    }
                },
                now = throughput.tick() => {
                    self.scheduler.roll_throughput(now);
                    self.reconciler.roll_throughput(now);
                }
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => {
                        if self.handle_command(command).await {
                            ticker = self.scheduler.new_interval();
                        }
                    }
                },
            }
            self.publish_status();
        }

        self.stop().await;
    }

    /// Tears everything down: scheduler idle, channel closed, capture released.
    /// Safe to call any number of times.
    pub async fn stop(&mut self) {
        self.scheduler.teardown();
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.video.release();
        self.publish_status();
        tracing::debug!("engine stopped");
    }

    pub fn snapshot(&self) -> EngineStatus {
        let current = self.reconciler.current();
        EngineStatus {
            channel_state: self.channel_state(),
            scheduler_state: self.scheduler.state(),
            target_rate_hz: self.scheduler.policy().target_rate_hz,
            tick_period_ms: self.scheduler.period().as_millis() as u64,
            frames_sent: self.scheduler.tick_count(),
            sent_fps: self.scheduler.sent_rate(),
            received_fps: self.reconciler.received_rate(),
            devices: self.video.devices().to_vec(),
            selected_device_id: self.video.selected_device_id().map(str::to_owned),
            camera_error: self.errors.camera().map(str::to_owned),
            connection_error: self.errors.connection().map(str::to_owned),
            detections: current
                .as_ref()
                .map(|result| result.detections.clone())
                .unwrap_or_default(),
            annotated_frame_available: current.is_some(),
            last_sequence: current.as_ref().and_then(|result| result.sequence),
            trailing_results: self.reconciler.window().len(),
            stale_results_dropped: self.reconciler.stale_dropped(),
            service_error: self.reconciler.last_service_error().map(str::to_owned),
        }
    }

    fn publish_status(&self) {
        let next = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn next_channel_event(channel: &mut Option<ChannelManager>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TransportMessage, OUTBOUND_QUEUE_DEPTH};
    use crate::device::{FrameSource, StreamConstraints, VideoDevice};
    use crate::encoder::{RawFrame, Resolution};
    use crate::error::CoreError;
    use crate::scheduler::{BackpressurePolicy, FrameTier, SchedulerState};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl Recorder {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn push(&self, entry: &'static str) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|e| **e == entry).count()
        }
    }

    struct DummySource {
        recorder: Recorder,
        stopped: bool,
    }

    impl FrameSource for DummySource {
        fn is_ready(&self) -> bool {
            !self.stopped
        }

        fn grab(&mut self) -> Option<RawFrame> {
            self.recorder.push("source_grab");
            Some(RawFrame::new(4, 4, vec![128; 48]))
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.recorder.push("source_stop");
            }
        }
    }

    struct DummyCapability {
        recorder: Recorder,
        devices: Vec<VideoDevice>,
        broken: Option<&'static str>,
        locked: Option<&'static str>,
    }

    #[async_trait::async_trait(?Send)]
    impl DeviceCapability for DummyCapability {
        async fn request_video_access(&self) -> CoreResult<()> {
            self.recorder.push("access");
            Ok(())
        }

        async fn enumerate_video_devices(&self) -> CoreResult<Vec<VideoDevice>> {
            self.recorder.push("enumerate");
            Ok(self.devices.clone())
        }

        async fn open_stream(
            &self,
            device_id: Option<&str>,
            _constraints: StreamConstraints,
        ) -> CoreResult<Box<dyn FrameSource>> {
            if self.devices.is_empty() {
                return Err(CoreError::NoDeviceFound);
            }
            if device_id.is_some() && device_id == self.broken {
                return Err(CoreError::CaptureUnavailable("device busy".into()));
            }
            if device_id.is_some() && device_id == self.locked {
                return Err(CoreError::PermissionDenied);
            }
            self.recorder.push("open_stream");
            Ok(Box::new(DummySource {
                recorder: self.recorder.clone(),
                stopped: false,
            }))
        }
    }

    struct DummyEncoder {
        recorder: Recorder,
    }

    impl FrameEncoder for DummyEncoder {
        fn encode(
            &self,
            _frame: &RawFrame,
            resolution: Resolution,
            _quality: f32,
        ) -> CoreResult<Option<Vec<u8>>> {
            self.recorder.push("encode");
            Ok(Some(resolution.width.to_be_bytes().to_vec()))
        }
    }

    struct LoopbackTransport {
        inbound: mpsc::UnboundedReceiver<TransportMessage>,
        reject_sends: bool,
        stall_sends: bool,
    }

    impl LoopbackTransport {
        async fn outcome(&self) -> CoreResult<()> {
            if self.stall_sends {
                std::future::pending::<()>().await;
            }
            if self.reject_sends {
                return Err(CoreError::SendFailed("socket gone".into()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Transport for LoopbackTransport {
        async fn connect(&mut self, _endpoint: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn send_binary(&mut self, _payload: Vec<u8>) -> CoreResult<()> {
            self.outcome().await
        }

        async fn send_text(&mut self, _payload: String) -> CoreResult<()> {
            self.outcome().await
        }

        async fn recv(&mut self) -> CoreResult<TransportMessage> {
            match self.inbound.recv().await {
                Some(message) => Ok(message),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn loopback() -> (LoopbackTransport, mpsc::UnboundedSender<TransportMessage>) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let transport = LoopbackTransport {
            inbound,
            reject_sends: false,
            stall_sends: false,
        };
        (transport, tx)
    }

    fn build_engine(
        recorder: Recorder,
        device_ids: &[&str],
        config: ClientConfig,
    ) -> LiveEngine<DummyCapability, DummyEncoder> {
        let capability = DummyCapability {
            recorder: recorder.clone(),
            devices: device_ids
                .iter()
                .map(|id| VideoDevice::new(*id, format!("Cam {id}")))
                .collect(),
            broken: Some("broken"),
            locked: Some("locked"),
        };
        LiveEngine::new(capability, DummyEncoder { recorder }, config).expect("valid config")
    }

    async fn open_channel(engine: &mut LiveEngine<DummyCapability, DummyEncoder>) {
        loop {
            let event = engine.handle_next_channel_event().await.expect("channel running");
            if event == ChannelEvent::Opened {
                return;
            }
        }
    }

    #[tokio::test]
    async fn start_opens_capture_then_runs_once_channel_is_open() {
        let recorder = Recorder::new();
        let mut engine =
            build_engine(recorder.clone(), &["front", "back"], ClientConfig::default());
        let (transport, _inbound) = loopback();

        engine.start(transport).await;
        assert_eq!(engine.scheduler().state(), SchedulerState::Paused);
        assert_eq!(engine.video().selected_device_id(), Some("front"));
        assert!(engine.errors().camera().is_none());

        open_channel(&mut engine).await;
        assert_eq!(engine.scheduler().state(), SchedulerState::Running);

        let outcome = engine.capture_tick();
        assert_eq!(
            outcome,
            TickOutcome::Sent {
                sequence: 0,
                tier: FrameTier::Keyframe,
                bytes: 4
            }
        );
        assert_eq!(
            recorder.entries(),
            vec![
                "access",
                "open_stream",
                "source_stop",
                "access",
                "enumerate",
                "open_stream",
                "source_grab",
                "encode",
            ]
        );

        engine.stop().await;
    }

    #[tokio::test]
    async fn zero_cameras_leaves_scheduler_paused_with_camera_error() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &[], ClientConfig::default());
        let (transport, _inbound) = loopback();

        engine.start(transport).await;
        open_channel(&mut engine).await;

        let status = engine.snapshot();
        assert!(status.devices.is_empty());
        assert_eq!(status.selected_device_id, None);
        assert_eq!(status.camera_error.as_deref(), Some(status::NO_CAMERA_MESSAGE));
        assert_eq!(status.channel_state, ChannelState::Open);
        assert_eq!(status.scheduler_state, SchedulerState::Paused);
        assert_eq!(engine.capture_tick(), TickOutcome::Skipped(SkipReason::NotRunning));

        engine.stop().await;
    }

    #[tokio::test]
    async fn results_replace_display_and_service_errors_are_kept() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &["front"], ClientConfig::default());
        let (transport, inbound) = loopback();
        engine.start(transport).await;
        open_channel(&mut engine).await;

        inbound
            .send(TransportMessage::Text(
                concat!(
                    r#"{"frame":"data:image/jpeg;base64,AA","#,
                    r#""detections":[{"class_id":0,"class_name":"person","confidence":0.8}]}"#,
                )
                .into(),
            ))
            .unwrap();
        engine.handle_next_channel_event().await;
        inbound
            .send(TransportMessage::Text(r#"{"error":"model not loaded"}"#.into()))
            .unwrap();
        engine.handle_next_channel_event().await;

        let status = engine.subscribe().borrow().clone();
        assert!(status.annotated_frame_available);
        assert_eq!(status.detections.len(), 1);
        assert_eq!(status.trailing_results, 1);
        assert_eq!(status.service_error.as_deref(), Some("model not loaded"));

        assert!(!engine.handle_command(EngineCommand::ClearResults).await);
        let status = engine.snapshot();
        assert!(!status.annotated_frame_available);
        assert!(status.detections.is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn single_flight_waits_for_result() {
        let recorder = Recorder::new();
        let config = ClientConfig {
            backpressure: BackpressurePolicy::SingleFlight,
            ..ClientConfig::default()
        };
        let mut engine = build_engine(recorder, &["front"], config);
        let (transport, inbound) = loopback();
        engine.start(transport).await;
        open_channel(&mut engine).await;

        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 0, .. }));
        assert_eq!(
            engine.capture_tick(),
            TickOutcome::Skipped(SkipReason::AwaitingResult)
        );

        inbound
            .send(TransportMessage::Text(r#"{"frame":"f","detections":[]}"#.into()))
            .unwrap();
        engine.handle_next_channel_event().await;
        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 1, .. }));

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_frame_stops_blocking_after_timeout() {
        let recorder = Recorder::new();
        let config = ClientConfig {
            backpressure: BackpressurePolicy::SingleFlight,
            in_flight_timeout_ms: 1_000,
            ..ClientConfig::default()
        };
        let mut engine = build_engine(recorder, &["front"], config);
        let (transport, _inbound) = loopback();
        engine.start(transport).await;
        open_channel(&mut engine).await;

        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 0, .. }));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(
            engine.capture_tick(),
            TickOutcome::Skipped(SkipReason::AwaitingResult)
        );

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 1, .. }));
        assert_eq!(engine.channel_state(), ChannelState::Open);

        engine.stop().await;
    }

    #[tokio::test]
    async fn dropped_frame_releases_single_flight_wait() {
        let recorder = Recorder::new();
        let config = ClientConfig {
            backpressure: BackpressurePolicy::SingleFlight,
            ..ClientConfig::default()
        };
        let mut engine = build_engine(recorder, &["front"], config);
        let (mut transport, _inbound) = loopback();
        transport.reject_sends = true;
        engine.start(transport).await;
        open_channel(&mut engine).await;

        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 0, .. }));
        assert_eq!(
            engine.capture_tick(),
            TickOutcome::Skipped(SkipReason::AwaitingResult)
        );

        assert_eq!(
            engine.handle_next_channel_event().await,
            Some(ChannelEvent::FrameDropped { sequence: 0 })
        );
        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 1, .. }));

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_channel_skips_ticks_instead_of_queueing() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &["front"], ClientConfig::default());
        let (mut transport, _inbound) = loopback();
        transport.stall_sends = true;
        engine.start(transport).await;
        open_channel(&mut engine).await;

        assert!(matches!(engine.capture_tick(), TickOutcome::Sent { sequence: 0, .. }));
        // Let the driver pick up the first frame and block in the transport.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            assert!(matches!(engine.capture_tick(), TickOutcome::Sent { .. }));
        }

        let sent = engine.scheduler().tick_count();
        assert_eq!(engine.capture_tick(), TickOutcome::Skipped(SkipReason::QueueFull));
        assert_eq!(engine.capture_tick(), TickOutcome::Skipped(SkipReason::QueueFull));
        assert_eq!(engine.scheduler().tick_count(), sent);

        engine.stop().await;
    }

    #[tokio::test]
    async fn denied_camera_reports_permission_message() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &["locked"], ClientConfig::default());
        let (transport, _inbound) = loopback();

        engine.start(transport).await;
        assert_eq!(engine.video().selected_device_id(), Some("locked"));
        assert!(!engine.video().has_session());
        assert_eq!(
            engine.errors().camera(),
            Some(status::CAMERA_PERMISSION_MESSAGE)
        );

        engine.stop().await;
    }

    #[tokio::test]
    async fn target_rate_change_reports_reschedule() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &["front"], ClientConfig::default());

        assert!(engine.handle_command(EngineCommand::SetTargetRate { hz: 10 }).await);
        assert_eq!(engine.scheduler().period(), Duration::from_millis(100));
        assert!(!engine.handle_command(EngineCommand::SetTargetRate { hz: 10 }).await);
        assert!(engine.handle_command(EngineCommand::SetTargetRate { hz: 60 }).await);
        assert_eq!(engine.snapshot().tick_period_ms, 50);
    }

    #[tokio::test]
    async fn failed_switch_sets_camera_error_and_pauses() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder, &["front", "broken"], ClientConfig::default());
        let (transport, _inbound) = loopback();
        engine.start(transport).await;
        open_channel(&mut engine).await;

        let err = engine.select_device("broken").await.unwrap_err();
        assert!(matches!(err, CoreError::DeviceSwitchFailed { .. }));
        assert_eq!(engine.errors().camera(), Some(status::CAMERA_SWITCH_MESSAGE));
        assert!(!engine.video().has_session());
        assert_eq!(engine.scheduler().state(), SchedulerState::Paused);
        assert!(engine.errors().connection().is_none());

        engine.select_device("front").await.unwrap();
        assert!(engine.errors().camera().is_none());
        assert_eq!(engine.scheduler().state(), SchedulerState::Running);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let recorder = Recorder::new();
        let mut engine = build_engine(recorder.clone(), &["front"], ClientConfig::default());
        let (transport, _inbound) = loopback();
        engine.start(transport).await;
        open_channel(&mut engine).await;

        engine.stop().await;
        engine.stop().await;

        let status = engine.snapshot();
        assert_eq!(status.scheduler_state, SchedulerState::Idle);
        assert_eq!(status.channel_state, ChannelState::Closed);
        assert!(!engine.video().has_session());
        // label-unlock source plus the live session
        assert_eq!(recorder.count("source_stop"), 2);
        assert!(engine.handle_next_channel_event().await.is_none());
    }
}

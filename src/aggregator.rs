//! Accident Aggregator (component F, the algorithmic heart): turns noisy
//! per-frame confidences into bounded `accident_open`/`accident_close`
//! events via an EMA filter, a soft-evidence accumulator, a warmup gate,
//! and a merge window that fuses brief dropouts back into one incident.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, Mode};
use crate::config::AggregatorConfig;
use crate::model::{
    AccidentCloseEvent, AccidentOpenEvent, Detection, Incident, Message, TOPIC_ACCIDENT,
    TOPIC_ACCIDENTS_CLOSE, TOPIC_ACCIDENTS_OPEN,
};

/// Pure, synchronous per-camera state machine. No I/O, no async: fully
/// deterministic given a detection trace, which is what makes it directly
/// testable.
pub struct AccidentAggregator {
    camera_id: String,
    session_id: String,
    params: AggregatorConfig,

    ema: f32,
    neg_streak: u32,
    soft_score: f32,
    open_incident: Option<Incident>,
    pending_incident: Option<Incident>,
    pending_vts: f64,
    last_vts: Option<f64>,
    warmup_left: u32,
    counter: u64,
}

impl AccidentAggregator {
    pub fn new(camera_id: String, session_id: String, params: AggregatorConfig) -> Self {
        let warmup_left = params.warmup_frames;
        Self {
            camera_id,
            session_id,
            params,
            ema: 0.0,
            neg_streak: 0,
            soft_score: 0.0,
            open_incident: None,
            pending_incident: None,
            pending_vts: 0.0,
            last_vts: None,
            warmup_left,
            counter: 0,
        }
    }

    fn next_incident_id(&mut self) -> String {
        self.counter += 1;
        format!("{}:{}:{}", self.session_id, self.camera_id, self.counter)
    }

    fn close_event(&self, incident: &Incident) -> Message {
        Message::AccidentClose(AccidentCloseEvent::from_incident(
            self.camera_id.clone(),
            self.session_id.clone(),
            incident,
        ))
    }

    /// Processes one detection, in order, and returns zero or more events
    /// to publish (in emission order).
    pub fn process(&mut self, detection: &Detection) -> Vec<Message> {
        let mut out = Vec::new();
        let current_vts = detection.vts;
        let confidence = detection.confidence;
        let is_positive = detection.happened || confidence >= self.params.min_open_conf;

        // 1. Flush a pending merge-window close once it has aged out.
        if let Some(pending) = self.pending_incident.take() {
            if current_vts - self.pending_vts > self.params.merge_gap {
                out.push(self.close_event(&pending));
            } else {
                self.pending_incident = Some(pending);
            }
        }

        // 2. Occlusion check, then advance last_vts.
        let occlusion_ok = match self.last_vts {
            None => true,
            Some(last) => current_vts - last <= self.params.occlusion_grace,
        };
        self.last_vts = Some(current_vts);

        // 3. EMA update.
        self.ema = self.params.alpha * confidence + (1.0 - self.params.alpha) * self.ema;

        // 4. Soft evidence update.
        if confidence >= self.params.evidence_min_conf {
            self.soft_score += (confidence - self.params.evidence_baseline).max(0.0) * self.params.soft_gain;
        }
        self.soft_score = (self.soft_score - self.params.soft_decay).max(0.0);

        // 5. Warmup gate.
        if self.open_incident.is_none() && self.warmup_left > 0 {
            self.warmup_left -= 1;
            return out;
        }

        // 6. Open decision.
        if self.open_incident.is_none()
            && self.soft_score >= self.params.open_score_threshold
            && confidence >= self.params.min_open_conf
        {
            // Invariant: any pending_incident surviving step 1 is within
            // merge_gap of current_vts, since step 1 already flushed it
            // otherwise.
            if let Some(mut incident) = self.pending_incident.take() {
                incident.end_vts = current_vts;
                incident.end_frame_idx = detection.frame_idx;
                incident.peak_confidence = incident.peak_confidence.max(confidence);
                if is_positive {
                    incident.positive_frames += 1;
                }
                self.open_incident = Some(incident);
                // Merge: no new open event.
            } else {
                let incident_id = self.next_incident_id();
                out.push(Message::AccidentOpen(AccidentOpenEvent::new(
                    self.camera_id.clone(),
                    incident_id.clone(),
                    self.session_id.clone(),
                    current_vts,
                    detection.frame_idx,
                    confidence,
                )));
                self.open_incident = Some(Incident {
                    incident_id,
                    start_vts: current_vts,
                    end_vts: current_vts,
                    peak_confidence: 0.0,
                    positive_frames: 0,
                    start_frame_idx: detection.frame_idx,
                    end_frame_idx: detection.frame_idx,
                });
            }
        }

        // 7. Ongoing update + close decision.
        if let Some(incident) = self.open_incident.as_mut() {
            incident.end_vts = current_vts;
            incident.end_frame_idx = detection.frame_idx;
            incident.peak_confidence = incident.peak_confidence.max(confidence);
            if is_positive {
                incident.positive_frames += 1;
            }

            if self.ema <= self.params.exit_threshold && occlusion_ok {
                self.neg_streak += 1;
            } else {
                self.neg_streak = 0;
            }

            if self.neg_streak >= self.params.min_end_neg_frames
                && (incident.end_vts - incident.start_vts) >= self.params.min_duration
            {
                let closed = self.open_incident.take().unwrap();
                self.pending_vts = closed.end_vts;
                self.pending_incident = Some(closed);
                self.ema = 0.0;
                self.neg_streak = 0;
                self.soft_score = 0.0;
            }
        }

        out
    }

    /// End-of-session flush. Idempotent: a second call with nothing
    /// pending or open returns an empty vec.
    pub fn flush(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        if let Some(pending) = self.pending_incident.take() {
            out.push(self.close_event(&pending));
        }
        if let Some(open) = self.open_incident.take() {
            out.push(self.close_event(&open));
        }
        out
    }
}

fn route(bus: &EventBus, camera_id: &str, events: Vec<Message>) {
    for event in events {
        match &event {
            Message::AccidentOpen(_) => bus.publish_partitioned(TOPIC_ACCIDENTS_OPEN, camera_id, event),
            Message::AccidentClose(_) => bus.publish_partitioned(TOPIC_ACCIDENTS_CLOSE, camera_id, event),
            _ => {}
        }
    }
}

/// Async wiring around the pure state machine: a task feeds it detections
/// from the bus, while the coordinator retains a handle to call `flush`
/// directly (per the shutdown order: flush happens before the task is
/// cancelled, so both sides share the aggregator behind a mutex).
pub struct AggregatorHandle {
    inner: Arc<Mutex<AccidentAggregator>>,
    task: JoinHandle<()>,
    camera_id: String,
}

impl AggregatorHandle {
    pub fn spawn(bus: Arc<EventBus>, camera_id: String, session_id: String, params: AggregatorConfig) -> Self {
        let inner = Arc::new(Mutex::new(AccidentAggregator::new(camera_id.clone(), session_id, params)));
        let task_inner = inner.clone();
        let task_bus = bus.clone();
        let task_camera_id = camera_id.clone();
        let task = tokio::spawn(async move {
            let (sub, _guard) = task_bus.subscribe(&format!("{TOPIC_ACCIDENT}:{task_camera_id}"), Mode::Fifo, 64);
            loop {
                match sub.recv_timeout(Duration::from_secs(1)).await {
                    Ok(Some(Message::Detection(detection))) => {
                        let events = task_inner.lock().process(&detection);
                        route(&task_bus, &task_camera_id, events);
                    }
                    Ok(Some(Message::Eos)) => break,
                    Ok(Some(_)) | Ok(None) => continue,
                    Err(()) => break,
                }
            }
        });
        Self {
            inner,
            task,
            camera_id,
        }
    }

    pub fn flush(&self, bus: &EventBus) {
        let events = self.inner.lock().flush();
        route(bus, &self.camera_id, events);
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AggregatorConfig {
        AggregatorConfig::default()
    }

    fn detection(vts: f64, frame_idx: u64, confidence: f32, threshold: f32) -> Detection {
        Detection {
            kind: Detection::TYPE,
            camera_id: "cam-1".to_string(),
            wall_ts: 0.0,
            frame_idx,
            source_pts: vts,
            vts,
            confidence,
            happened: confidence >= threshold,
        }
    }

    fn opens(events: &[Message]) -> usize {
        events.iter().filter(|m| matches!(m, Message::AccidentOpen(_))).count()
    }
    fn closes(events: &[Message]) -> usize {
        events.iter().filter(|m| matches!(m, Message::AccidentClose(_))).count()
    }

    fn run_trace(confidences: &[f32], step: f64, decision_threshold: f32) -> Vec<Message> {
        let mut agg = AccidentAggregator::new("cam-1".to_string(), "sess-1".to_string(), params());
        let mut out = Vec::new();
        for (i, &conf) in confidences.iter().enumerate() {
            let det = detection(i as f64 * step, i as u64, conf, decision_threshold);
            out.extend(agg.process(&det));
        }
        out.extend(agg.flush());
        out
    }

    #[test]
    fn s1_clean_single_incident() {
        let step = 1.0 / 15.0;
        let mut confidences = vec![0.02f32; 200];
        for c in confidences.iter_mut().take(121).skip(30) {
            *c = 0.80;
        }
        let events = run_trace(&confidences, step, 0.65);
        assert_eq!(opens(&events), 1);
        assert_eq!(closes(&events), 1);
        if let Message::AccidentOpen(open) = events.iter().find(|m| matches!(m, Message::AccidentOpen(_))).unwrap() {
            assert!(open.pts_in_video >= 30.0 * step && open.pts_in_video <= 40.0 * step);
            assert_eq!(open.peak_confidence, 0.80);
        }
    }

    #[test]
    fn s2_brief_dropout_merges() {
        let step = 1.0 / 15.0;
        let mut confidences = vec![0.02f32; 121];
        for c in confidences.iter_mut().take(61).skip(30) {
            *c = 0.70;
        }
        for c in confidences.iter_mut().take(81).skip(61) {
            *c = 0.02;
        }
        for c in confidences.iter_mut().take(121).skip(81) {
            *c = 0.75;
        }
        let events = run_trace(&confidences, step, 0.65);
        assert_eq!(opens(&events), 1);
        assert_eq!(closes(&events), 1);
    }

    #[test]
    fn s3_isolated_spike_never_opens() {
        let step = 1.0 / 15.0;
        let mut confidences = vec![0.01f32; 60];
        confidences[30] = 0.95;
        let events = run_trace(&confidences, step, 0.65);
        assert_eq!(opens(&events), 0);
    }

    #[test]
    fn s4_warmup_suppresses_early_signal() {
        let step = 1.0 / 15.0;
        let mut confidences = vec![0.0f32; 20];
        for c in confidences.iter_mut().take(5) {
            *c = 0.95;
        }
        let events = run_trace(&confidences, step, 0.65);
        assert_eq!(opens(&events), 0);
    }

    #[test]
    fn s6_eof_flush_closes_open_incident() {
        let step = 1.0 / 15.0;
        let mut confidences = vec![0.02f32; 60];
        for c in confidences.iter_mut().skip(30) {
            *c = 0.9;
        }
        let events = run_trace(&confidences, step, 0.65);
        assert_eq!(opens(&events), 1);
        assert_eq!(closes(&events), 1);
    }

    #[test]
    fn incident_ids_strictly_increase_per_camera() {
        let step = 1.0 / 15.0;
        // Two well-separated incidents (farther apart than merge_gap).
        let mut confidences = vec![0.02f32; 400];
        for c in confidences.iter_mut().take(121).skip(30) {
            *c = 0.9;
        }
        for c in confidences.iter_mut().take(350).skip(300) {
            *c = 0.9;
        }
        let events = run_trace(&confidences, step, 0.65);
        let ids: Vec<String> = events
            .iter()
            .filter_map(|m| match m {
                Message::AccidentOpen(o) => Some(o.incident_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut agg = AccidentAggregator::new("cam-1".to_string(), "sess-1".to_string(), params());
        let det = detection(0.0, 0, 0.9, 0.65);
        let _ = agg.process(&det);
        let first = agg.flush();
        let second = agg.flush();
        assert!(!first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn deterministic_trace_replays_identically() {
        let confidences: Vec<f32> = (0..80).map(|i| if (30..60).contains(&i) { 0.9 } else { 0.02 }).collect();
        let first = run_trace(&confidences, 1.0 / 15.0, 0.65);
        let second = run_trace(&confidences, 1.0 / 15.0, 0.65);
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn incident_end_vts_never_precedes_start_vts() {
        let confidences: Vec<f32> = (0..80).map(|i| if (30..60).contains(&i) { 0.9 } else { 0.02 }).collect();
        let mut agg = AccidentAggregator::new("cam-1".to_string(), "sess-1".to_string(), params());
        for (i, &conf) in confidences.iter().enumerate() {
            let det = detection(i as f64 * (1.0 / 15.0), i as u64, conf, 0.65);
            for event in agg.process(&det) {
                if let Message::AccidentClose(close) = event {
                    assert!(close.end_ts >= close.start_ts);
                    assert!(close.peak_confidence >= params().min_open_conf);
                }
            }
        }
    }
}

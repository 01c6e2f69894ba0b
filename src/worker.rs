use crate::{
    api::DetectedVehicle,
    detector::{DetectorConfig, VehicleDetector, build_detector},
    image::Image,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use std::{sync::Arc, time::Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 16;

pub type DetectionReply = oneshot::Sender<anyhow::Result<Vec<DetectedVehicle>>>;
pub type DetectionRequest = (Arc<Image>, DateTime<Utc>, DetectionReply, Instant);

/// Owns the blocking detector and serves requests from a bounded queue.
pub struct DetectorWorker {
    receiver: Receiver<DetectionRequest>,
    detector: Box<dyn VehicleDetector>,
}

impl DetectorWorker {
    pub fn new(
        detector_config: DetectorConfig,
        worker_queue_size: Option<usize>,
    ) -> anyhow::Result<(DetectorHandle, DetectorWorker)> {
        Ok(Self::from_detector(
            build_detector(detector_config)?,
            worker_queue_size,
        ))
    }

    pub fn from_detector(
        detector: Box<dyn VehicleDetector>,
        worker_queue_size: Option<usize>,
    ) -> (DetectorHandle, DetectorWorker) {
        let queue_size = worker_queue_size.unwrap_or(DEFAULT_WORKER_QUEUE_SIZE).max(1);
        let (sender, receiver) = bounded(queue_size);
        info!(queue_size, "Detector worker queue created");
        (
            DetectorHandle { sender },
            DetectorWorker { receiver, detector },
        )
    }

    pub fn model_name(&self) -> &str {
        self.detector.model_name()
    }

    pub fn spawn_worker_thread(mut self) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    /// Runs until every [`DetectorHandle`] is dropped.
    pub fn run(&mut self) {
        while let Ok((image, timestamp, response_sender, queued_at)) = self.receiver.recv() {
            debug!(queue_time = ?queued_at.elapsed(), %image, "Detector request dequeued");
            let detect_result = self.detector.process_frame(&image, timestamp);
            if let Err(err) = &detect_result {
                warn!(%err, %image, "Vehicle detection failed");
            }
            if response_sender.send(detect_result).is_err() {
                error!("Failed to send response from worker, requester is gone");
            }
        }
        info!("Detector worker stopped");
    }
}

/// Cloneable async front end of the detector worker.
#[derive(Clone)]
pub struct DetectorHandle {
    sender: Sender<DetectionRequest>,
}

impl DetectorHandle {
    /// Number of requests the worker queue holds before `detect` starts rejecting.
    pub fn queue_capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(DEFAULT_WORKER_QUEUE_SIZE)
    }

    pub async fn detect(&self, image: Arc<Image>) -> anyhow::Result<Vec<DetectedVehicle>> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        match self
            .sender
            .try_send((image, Utc::now(), reply_sender, Instant::now()))
        {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Detector queue is full, rejecting request");
                return Err(anyhow!("Detector queue is full"));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(anyhow!("Detector worker is not running"));
            }
        }
        reply_receiver
            .await
            .map_err(|_| anyhow!("Detector worker dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::VehicleCoordinates;

    struct CountingDetector {
        calls: u64,
    }

    impl VehicleDetector for CountingDetector {
        fn process_frame(
            &mut self,
            image: &Image,
            _timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Vec<DetectedVehicle>> {
            self.calls += 1;
            if image.width == 0 {
                anyhow::bail!("empty image");
            }
            Ok(vec![DetectedVehicle::new(
                self.calls,
                "car",
                0.5,
                VehicleCoordinates::default(),
            )])
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let (handle, worker) =
            DetectorWorker::from_detector(Box::new(CountingDetector { calls: 0 }), Some(4));
        assert_eq!(worker.model_name(), "counting");
        assert_eq!(handle.queue_capacity(), 4);
        let thread = worker.spawn_worker_thread();

        let image = Arc::new(Image::new(None, 2, 2, vec![0; 12]).unwrap());
        let first = handle.detect(image.clone()).await.unwrap();
        let second = handle.detect(image).await.unwrap();
        assert_eq!(first[0].vehicle_id, 1);
        assert_eq!(second[0].vehicle_id, 2);

        let err = handle.detect(Arc::new(Image::default())).await.unwrap_err();
        assert!(err.to_string().contains("empty image"));

        drop(handle);
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        // Worker never started, so the single slot stays occupied.
        let (handle, _worker) =
            DetectorWorker::from_detector(Box::new(CountingDetector { calls: 0 }), Some(1));
        let (reply, _rx) = oneshot::channel();
        handle
            .sender
            .try_send((Arc::new(Image::default()), Utc::now(), reply, Instant::now()))
            .unwrap();
        let err = handle.detect(Arc::new(Image::default())).await.unwrap_err();
        assert!(err.to_string().contains("queue is full"));
    }
}

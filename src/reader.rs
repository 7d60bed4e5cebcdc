use chrono::Local;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::signal::join_within;
use crate::source::{FrameStream, Interrupter, StreamError, StreamSource};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
const RELEASE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bufferless reader over one live connection.
///
/// A dedicated thread keeps pulling frames and only ever holds the newest one, so a consumer
/// that reads every few seconds gets a fresh frame rather than the head of a stale backlog.
pub struct StreamReader {
    shared: Arc<Shared>,
    interrupt: Interrupter,
    worker: Mutex<Option<JoinHandle<()>>>,
    read_timeout: Duration,
}

struct Shared {
    slot: Mutex<Slot>,
    arrived: Condvar,
    stopped: AtomicBool,
    read_error: AtomicBool,
    broken: AtomicBool,
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    delivered: u64,
    discarded: u64,
}

impl StreamReader {
    /// Starts the acquisition thread over an already open stream.
    pub fn spawn(stream: Box<dyn FrameStream>) -> Result<Self, StreamError> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            arrived: Condvar::new(),
            stopped: AtomicBool::new(false),
            read_error: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        let interrupt = stream.interrupter();

        let worker = std::thread::Builder::new()
            .name("stream-reader".into())
            .spawn({
                let shared = shared.clone();
                move || acquire(shared, stream)
            })
            .map_err(StreamError::ThreadSpawn)?;

        Ok(Self {
            shared,
            interrupt,
            worker: Mutex::new(Some(worker)),
            read_timeout: READ_TIMEOUT,
        })
    }

    /// Opens `source` and waits up to `open_timeout` for the first frame to prove the
    /// connection works.
    pub fn connect(source: &dyn StreamSource, open_timeout: Duration) -> Result<Self, StreamError> {
        let reader = Self::spawn(source.open()?)?;

        if !reader.wait_for_first_frame(open_timeout) {
            reader.release();
            return Err(StreamError::OpenTimeout(open_timeout));
        }

        Ok(reader)
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Takes the newest frame, waiting up to the read timeout for one to arrive.
    pub fn read(&self) -> Result<Frame, StreamError> {
        if !self.is_open() {
            return Err(StreamError::NotOpen);
        }

        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        shared.arrived.wait_while_for(
            &mut slot,
            |slot| slot.frame.is_none() && !shared.is_closed(),
            self.read_timeout,
        );

        match slot.frame.take() {
            Some(frame) => Ok(frame),
            None if shared.is_closed() => Err(StreamError::NotOpen),
            None => Err(StreamError::Timeout(self.read_timeout)),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed() && !self.shared.read_error.load(Ordering::Acquire)
    }

    /// Stops the acquisition thread and waits (bounded) for it to exit. Safe to call repeatedly
    /// and from any thread.
    pub fn release(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        {
            let _slot = self.shared.slot.lock();
            self.shared.arrived.notify_all();
        }

        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        (self.interrupt)();

        if !join_within(worker, RELEASE_JOIN_TIMEOUT) {
            warn!(
                "Stream reader thread did not exit within {:?}",
                RELEASE_JOIN_TIMEOUT
            );
        }
    }

    pub fn frames_delivered(&self) -> u64 {
        self.shared.slot.lock().delivered
    }

    /// Frames replaced in the slot before anyone read them.
    pub fn frames_discarded(&self) -> u64 {
        self.shared.slot.lock().discarded
    }

    fn wait_for_first_frame(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        shared.arrived.wait_while_for(
            &mut slot,
            |slot| slot.delivered == 0 && !shared.is_closed(),
            timeout,
        );
        slot.delivered > 0
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.release();
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire)
    }
}

fn acquire(shared: Arc<Shared>, mut stream: Box<dyn FrameStream>) {
    while !shared.stopped.load(Ordering::Acquire) {
        match stream.next_frame() {
            Ok(jpeg) => {
                shared.read_error.store(false, Ordering::Release);

                let mut slot = shared.slot.lock();
                slot.delivered += 1;
                let frame = Frame {
                    jpeg,
                    received_at: Local::now().naive_local(),
                    sequence: slot.delivered,
                };
                if slot.frame.replace(frame).is_some() {
                    slot.discarded += 1;
                }
                drop(slot);

                shared.arrived.notify_all();
            }
            Err(err) if err.is_fatal() => {
                if !shared.stopped.load(Ordering::Acquire) {
                    warn!("Video stream closed: {}", err);
                }
                shared.broken.store(true, Ordering::Release);
                let _slot = shared.slot.lock();
                shared.arrived.notify_all();
                break;
            }
            Err(err) => {
                debug!("Frame read failed, retrying: {}", err);
                shared.read_error.store(true, Ordering::Release);
                std::thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeSource, FakeStream};
    use std::time::Instant;

    #[test]
    fn read_returns_the_newest_frame_only() {
        let reader = StreamReader::spawn(FakeStream::burst(5).boxed()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || reader.frames_delivered() == 5));

        let frame = reader.read().unwrap();
        assert_eq!(frame.sequence, 5);
        assert_eq!(reader.frames_discarded(), 4);
    }

    #[test]
    fn slow_consumer_skips_stale_frames() {
        let reader =
            StreamReader::spawn(FakeStream::steady(Duration::from_millis(2)).boxed()).unwrap();

        let mut last = 0;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(15));
            let frame = reader.read().unwrap();
            assert!(frame.sequence > last);
            assert!(frame.sequence <= reader.frames_delivered());
            last = frame.sequence;
        }
        assert!(reader.frames_discarded() > 0);
    }

    #[test]
    fn read_times_out_without_frames() {
        let reader = StreamReader::spawn(FakeStream::burst(0).boxed())
            .unwrap()
            .with_read_timeout(Duration::from_millis(40));

        assert!(reader.is_open());
        assert!(matches!(reader.read(), Err(StreamError::Timeout(_))));
    }

    #[test]
    fn ended_stream_is_reported_closed() {
        let reader = StreamReader::spawn(FakeStream::burst(1).then_end().boxed()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !reader.is_open()));
        assert!(matches!(reader.read(), Err(StreamError::NotOpen)));
    }

    #[test]
    fn release_is_idempotent_and_bounded() {
        let reader = Arc::new(
            StreamReader::spawn(FakeStream::steady(Duration::from_millis(5)).boxed()).unwrap(),
        );

        let started = Instant::now();
        let other = reader.clone();
        std::thread::spawn(move || other.release()).join().unwrap();
        reader.release();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!reader.is_open());
        assert!(matches!(reader.read(), Err(StreamError::NotOpen)));
    }

    #[test]
    fn connect_requires_a_first_frame() {
        let silent = FakeSource::silent();
        let err = StreamReader::connect(&silent, Duration::from_millis(50))
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::OpenTimeout(_)));

        let live = FakeSource::live(Duration::from_millis(5));
        let reader = StreamReader::connect(&live, Duration::from_secs(2)).unwrap();
        assert!(reader.is_open());
        assert!(reader.read().is_ok());
    }
}

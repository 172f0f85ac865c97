//! Remote plugin GUI streaming.
//!
//! One background task per session reads screen frames, patches them into a
//! shared RGBA image and hands the result to the registered callback. Delivered
//! images are never written again: the next update copies on write if the
//! consumer still holds the previous one.

use crate::audio::{FailureGuard, FailureHook, Supervised};
use crate::codec::{self, FrameReader};
use crate::error::Result;
use crate::protocol::ScreenFrameHeader;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::runtime::Handle;
use tokio::sync::watch;

pub const BYTES_PER_PIXEL: usize = 4;

/// Decoded remote GUI image (RGBA, row-major).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ScreenImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[at..at + BYTES_PER_PIXEL]);
        Some(px)
    }

    /// Copies the rectangle described by `header` into the image.
    fn patch(&mut self, header: &ScreenFrameHeader, rect: &[u8]) {
        let row_len = header.w as usize * BYTES_PER_PIXEL;
        let stride = self.width as usize * BYTES_PER_PIXEL;
        for row in 0..header.h as usize {
            let src = &rect[row * row_len..(row + 1) * row_len];
            let at = (header.y as usize + row) * stride + header.x as usize * BYTES_PER_PIXEL;
            self.pixels[at..at + row_len].copy_from_slice(src);
        }
    }
}

/// Receives each completed image with its width and height.
pub type ScreenCallback = Box<dyn Fn(Arc<ScreenImage>, u32, u32) + Send + Sync>;

/// Callback slot shared between the session and the screen task.
pub type ScreenSink = Arc<ArcSwapOption<ScreenCallback>>;

pub struct ScreenStreamer {
    latest: Arc<ArcSwapOption<ScreenImage>>,
    delivered: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<Supervised>>,
}

impl ScreenStreamer {
    pub fn start<R>(
        runtime: &Handle,
        reader: FrameReader<R>,
        sink: ScreenSink,
        on_failure: FailureHook,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let latest = Arc::new(ArcSwapOption::empty());
        let delivered = Arc::new(AtomicU64::new(0));
        let healthy = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = {
            let worker = Worker {
                latest: Arc::clone(&latest),
                delivered: Arc::clone(&delivered),
                sink,
            };
            let guard = FailureGuard::new(&healthy, &on_failure, "screen streamer");
            Supervised::spawn(runtime, guard, worker.run(reader, shutdown_rx))
        };

        Self {
            latest,
            delivered,
            healthy,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Most recently delivered image.
    pub fn latest(&self) -> Option<Arc<ScreenImage>> {
        self.latest.load_full()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signals shutdown and waits up to `wait`; the task is aborted after that.
    pub fn stop(&self, runtime: &Handle, wait: Duration) {
        let _ = self.shutdown.send(true);
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let worker = task.worker.clone();
        let joined = runtime.block_on(async { tokio::time::timeout(wait, task.supervisor).await });
        if joined.is_err() {
            tracing::warn!("screen streamer did not stop within {:?}, aborting", wait);
            worker.abort();
        }
    }
}

impl Drop for ScreenStreamer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

struct Worker {
    latest: Arc<ArcSwapOption<ScreenImage>>,
    delivered: Arc<AtomicU64>,
    sink: ScreenSink,
}

impl Worker {
    async fn run<R: AsyncRead + Unpin>(
        self,
        mut reader: FrameReader<R>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut image: Option<Arc<ScreenImage>> = None;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let payload = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                frame = reader.next_frame() => frame?,
            };
            let (header, rect) = codec::decode_screen(&payload, reader.max_frame_size())?;

            let mut current = match image.take() {
                Some(img) if img.width == header.width && img.height == header.height => img,
                _ => Arc::new(ScreenImage::new(header.width, header.height)),
            };
            Arc::make_mut(&mut current).patch(&header, rect);

            // A stop request that raced with decoding wins over delivery.
            if *shutdown.borrow() {
                return Ok(());
            }
            self.latest.store(Some(Arc::clone(&current)));
            if let Some(callback) = self.sink.load().as_ref() {
                callback(Arc::clone(&current), header.width, header.height);
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            image = Some(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, ErrorKind};
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn screen_frame(header: ScreenFrameHeader, value: u8) -> Vec<u8> {
        let pixels = vec![value; header.payload_len()];
        codec::frame(&codec::encode_screen(&header, &pixels).unwrap())
    }

    fn counting_sink() -> (ScreenSink, Arc<Mutex<Vec<(u32, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ScreenSink = Arc::new(ArcSwapOption::empty());
        let record = Arc::clone(&seen);
        let callback: ScreenCallback = Box::new(move |_image, w, h| record.lock().push((w, h)));
        sink.store(Some(Arc::new(callback)));
        (sink, seen)
    }

    fn no_failure() -> FailureHook {
        Arc::new(|_| {})
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_full_then_dirty_rect() {
        let rt = runtime();
        let (mut server, client) = tokio::io::duplex(1 << 16);
        let (sink, seen) = counting_sink();
        let reader = FrameReader::new(client, 1 << 20);
        let streamer = ScreenStreamer::start(rt.handle(), reader, sink, no_failure());

        rt.block_on(async {
            server.write_all(&screen_frame(ScreenFrameHeader::full(4, 2), 10)).await.unwrap();
        });
        assert!(wait_for(|| streamer.frames_delivered() == 1));
        let first = streamer.latest().unwrap();

        let dirty = ScreenFrameHeader { width: 4, height: 2, x: 1, y: 1, w: 2, h: 1 };
        rt.block_on(async {
            server.write_all(&screen_frame(dirty, 99)).await.unwrap();
        });
        assert!(wait_for(|| streamer.frames_delivered() == 2));
        let second = streamer.latest().unwrap();

        // The first delivered image is untouched.
        assert_eq!(first.pixel(1, 1), Some([10; 4]));
        assert_eq!(second.pixel(1, 1), Some([99; 4]));
        assert_eq!(second.pixel(2, 1), Some([99; 4]));
        assert_eq!(second.pixel(3, 1), Some([10; 4]));
        assert_eq!(second.pixel(0, 0), Some([10; 4]));
        assert_eq!(*seen.lock(), vec![(4, 2), (4, 2)]);

        streamer.stop(rt.handle(), Duration::from_secs(1));
    }

    #[test]
    fn test_stop_during_partial_frame() {
        let rt = runtime();
        let (mut server, client) = tokio::io::duplex(1 << 16);
        let (sink, seen) = counting_sink();
        let reader = FrameReader::new(client, 1 << 20);
        let streamer = ScreenStreamer::start(rt.handle(), reader, sink, no_failure());

        let frame = screen_frame(ScreenFrameHeader::full(8, 8), 7);
        rt.block_on(async {
            server.write_all(&frame[..frame.len() / 2]).await.unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        streamer.stop(rt.handle(), Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(streamer.is_finished());
        assert!(seen.lock().is_empty());
        assert!(streamer.latest().is_none());
        assert!(streamer.is_ok());
    }

    #[test]
    fn test_peer_close_reports_failure() {
        let rt = runtime();
        let (server, client) = tokio::io::duplex(1024);
        let failures = Arc::new(AtomicU64::new(0));
        let hook: FailureHook = {
            let failures = Arc::clone(&failures);
            Arc::new(move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };
        let sink: ScreenSink = Arc::new(ArcSwapOption::empty());
        let streamer = ScreenStreamer::start(rt.handle(), FrameReader::new(client, 1024), sink, hook);
        drop(server);

        assert!(wait_for(|| !streamer.is_ok()));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        streamer.stop(rt.handle(), Duration::from_millis(100));
    }

    fn counting_hook() -> (FailureHook, Arc<Mutex<Vec<ErrorKind>>>) {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&failures);
        let hook: FailureHook = Arc::new(move |e: ClientError| record.lock().push(e.kind()));
        (hook, failures)
    }

    #[test]
    fn test_oversized_image_is_protocol_failure() {
        let rt = runtime();
        let (mut server, client) = tokio::io::duplex(1 << 16);
        let (sink, seen) = counting_sink();
        let (hook, failures) = counting_hook();
        let streamer = ScreenStreamer::start(rt.handle(), FrameReader::new(client, 1 << 20), sink, hook);

        let header = ScreenFrameHeader {
            width: u32::MAX,
            height: u32::MAX,
            x: 0,
            y: 0,
            w: 1,
            h: 1,
        };
        rt.block_on(async {
            server.write_all(&screen_frame(header, 1)).await.unwrap();
        });

        assert!(wait_for(|| !streamer.is_ok()));
        assert!(wait_for(|| streamer.is_finished()));
        assert_eq!(*failures.lock(), vec![ErrorKind::Protocol]);
        assert!(seen.lock().is_empty());
        assert!(streamer.latest().is_none());
    }

    #[test]
    fn test_panicking_callback_reports_failure() {
        let rt = runtime();
        let (mut server, client) = tokio::io::duplex(1 << 16);
        let sink: ScreenSink = Arc::new(ArcSwapOption::empty());
        let callback: ScreenCallback = Box::new(|_image, _w, _h| panic!("consumer bug"));
        sink.store(Some(Arc::new(callback)));
        let (hook, failures) = counting_hook();
        let streamer = ScreenStreamer::start(rt.handle(), FrameReader::new(client, 1 << 20), sink, hook);

        rt.block_on(async {
            server.write_all(&screen_frame(ScreenFrameHeader::full(2, 2), 5)).await.unwrap();
        });

        assert!(wait_for(|| !streamer.is_ok()));
        assert!(wait_for(|| streamer.is_finished()));
        assert_eq!(*failures.lock(), vec![ErrorKind::Protocol]);
        streamer.stop(rt.handle(), Duration::from_millis(100));
    }
}

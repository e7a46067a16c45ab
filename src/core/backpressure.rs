//! Outbound buffer occupancy tracking with high/low watermark hysteresis.
//!
//! Producers reserve bytes before queueing a frame for the socket and hold a
//! [`GaugeTicket`] until the frame has been written. When occupancy exceeds the
//! high watermark the gauge pauses. Producers hold frames while
//! [`OutboundGauge::is_paused`]; [`OutboundGauge::wait_for_capacity`] resolves
//! once occupancy drops below the low watermark.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Default pause threshold: about one second of 24kHz mono audio.
pub const DEFAULT_HIGH_WATERMARK: usize = 48 * 1024;

/// Default resume threshold.
pub const DEFAULT_LOW_WATERMARK: usize = 16 * 1024;

#[derive(Debug)]
struct GaugeInner {
    queued: AtomicUsize,
    high: usize,
    low: usize,
    paused: AtomicBool,
    resume: Notify,
}

/// Shared occupancy counter for the outbound socket queue.
#[derive(Debug, Clone)]
pub struct OutboundGauge {
    inner: Arc<GaugeInner>,
}

impl Default for OutboundGauge {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}

impl OutboundGauge {
    /// `low` is clamped to at most `high`.
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                queued: AtomicUsize::new(0),
                high,
                low: low.min(high),
                paused: AtomicBool::new(false),
                resume: Notify::new(),
            }),
        }
    }

    /// Bytes currently reserved.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Waits until the producer may send another frame.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.inner.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }

    /// Reserves `len` bytes, pausing the gauge if the high watermark is crossed.
    pub fn reserve(&self, len: usize) -> GaugeTicket {
        let queued = self.inner.queued.fetch_add(len, Ordering::AcqRel) + len;
        if queued > self.inner.high && !self.inner.paused.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "Outbound queue above high watermark ({} > {} bytes), pausing producer",
                queued,
                self.inner.high
            );
        }
        GaugeTicket {
            inner: self.inner.clone(),
            len,
        }
    }

    fn release(inner: &GaugeInner, len: usize) {
        let queued = inner.queued.fetch_sub(len, Ordering::AcqRel) - len;
        if queued < inner.low && inner.paused.swap(false, Ordering::AcqRel) {
            tracing::debug!("Outbound queue drained to {} bytes, resuming producer", queued);
            inner.resume.notify_waiters();
        }
    }
}

/// Reservation released when dropped.
#[derive(Debug)]
pub struct GaugeTicket {
    inner: Arc<GaugeInner>,
    len: usize,
}

impl Drop for GaugeTicket {
    fn drop(&mut self) {
        OutboundGauge::release(&self.inner, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hysteresis() {
        let gauge = OutboundGauge::new(100, 40);
        let a = gauge.reserve(60);
        let b = gauge.reserve(50);
        assert!(gauge.is_paused());
        assert_eq!(gauge.queued(), 110);

        // Below high but not below low: stays paused
        drop(b);
        assert_eq!(gauge.queued(), 60);
        assert!(gauge.is_paused());

        drop(a);
        assert_eq!(gauge.queued(), 0);
        assert!(!gauge.is_paused());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_not_paused() {
        let gauge = OutboundGauge::new(100, 40);
        let _t = gauge.reserve(10);
        tokio::time::timeout(Duration::from_millis(50), gauge.wait_for_capacity())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_paused_producer_resumes_below_low_watermark() {
        let gauge = OutboundGauge::new(100, 40);
        let ticket = gauge.reserve(150);
        assert!(gauge.is_paused());

        let waiter = {
            let gauge = gauge.clone();
            tokio::spawn(async move { gauge.wait_for_capacity().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(ticket);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_low_clamped_to_high() {
        let gauge = OutboundGauge::new(10, 50);
        let t = gauge.reserve(11);
        assert!(gauge.is_paused());
        drop(t);
        assert!(!gauge.is_paused());
    }
}

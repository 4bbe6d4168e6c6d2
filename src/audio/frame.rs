/// One microphone frame: mono f32 samples in -1..1 at a fixed rate.
/// Immutable once created; ownership moves into the capture session.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Fixed-size accumulation buffer feeding the detector.
///
/// Consumes frames in arrival order and yields complete windows; after a
/// drain it retains strictly less than one window of unconsumed samples.
#[derive(Debug)]
pub struct SlidingWindow {
    size: usize,
    pending: Vec<f32>,
}

impl SlidingWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            pending: Vec::with_capacity(size * 2),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn extend(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Pop the next complete window, if one is available.
    pub fn next_window(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.size {
            return None;
        }
        let rest = self.pending.split_off(self.size);
        let window = std::mem::replace(&mut self.pending, rest);
        Some(window)
    }

    /// Zero-pad and take the trailing partial window at end of input.
    /// Returns None if nothing is pending.
    pub fn take_padded(&mut self) -> Option<Vec<f32>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut window = std::mem::take(&mut self.pending);
        window.resize(self.size, 0.0);
        Some(window)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_emits_in_arrival_order() {
        let mut win = SlidingWindow::new(4);
        win.extend(&[1.0, 2.0, 3.0]);
        assert!(win.next_window().is_none());

        win.extend(&[4.0, 5.0]);
        let w = win.next_window().expect("one full window");
        assert_eq!(w, vec![1.0, 2.0, 3.0, 4.0]);

        // Remainder stays below one window
        assert_eq!(win.pending_len(), 1);
        assert!(win.next_window().is_none());
    }

    #[test]
    fn window_drains_overflow() {
        let mut win = SlidingWindow::new(2);
        win.extend(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(win.next_window().unwrap(), vec![1.0, 2.0]);
        assert_eq!(win.next_window().unwrap(), vec![3.0, 4.0]);
        assert!(win.next_window().is_none());
        assert_eq!(win.pending_len(), 1);
    }

    #[test]
    fn trailing_window_is_zero_padded() {
        let mut win = SlidingWindow::new(4);
        win.extend(&[0.5, 0.5]);
        let w = win.take_padded().unwrap();
        assert_eq!(w, vec![0.5, 0.5, 0.0, 0.0]);
        assert!(win.take_padded().is_none());
    }
}

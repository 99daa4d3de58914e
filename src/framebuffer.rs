//! The per-session pixel grid and its accumulated dirty-region log.
//!
//! A single [`Framebuffer`] is shared between the session's read loop
//! (writer) and the broadcaster (reader): the read loop applies upstream
//! rectangles and records what changed, and the broadcaster periodically
//! takes a snapshot of the accumulated damage. Both sides go through one
//! mutex; callers must not hold it across an `.await` point.

use std::sync::Mutex;
use tokio::sync::Notify;

/// An axis-aligned rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    /// The smallest rectangle containing both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Rect) -> Rect {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = (u32::from(self.x) + u32::from(self.width)).max(u32::from(other.x) + u32::from(other.width));
        let y1 = (u32::from(self.y) + u32::from(self.height)).max(u32::from(other.y) + u32::from(other.height));
        Rect {
            x: x0,
            y: y0,
            width: (x1 - u32::from(x0)) as u16,
            height: (y1 - u32::from(y0)) as u16,
        }
    }
}

/// The background color a freshly (re)sized framebuffer is filled with,
/// before the upstream sends any rectangles for the new area. Matches the
/// original implementation's placeholder gray.
const FILL_COLOR: [u8; 3] = [30, 30, 30];

/// RGB pixel grid (row-major, 3 bytes per pixel) plus the rectangles that
/// have changed since the broadcaster last drained them.
pub struct Framebuffer {
    inner: Mutex<Inner>,
    dirty_signal: Notify,
}

struct Inner {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
    dirty: Vec<Rect>,
}

impl Framebuffer {
    /// Creates a framebuffer of the given size, filled with [`FILL_COLOR`].
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        let pixels = filled(width, height);
        Self {
            inner: Mutex::new(Inner {
                width,
                height,
                pixels,
                dirty: Vec::new(),
            }),
            dirty_signal: Notify::new(),
        }
    }

    /// Resolves once some mutation has marked the framebuffer dirty since
    /// the last resolution. Used by the broadcaster to wake without polling.
    pub async fn dirty(&self) {
        self.dirty_signal.notified().await;
    }

    /// Current framebuffer dimensions.
    #[must_use]
    pub fn dimensions(&self) -> (u16, u16) {
        let inner = self.inner.lock().unwrap();
        (inner.width, inner.height)
    }

    /// Writes `rgb` (row-major, 3 bytes per pixel, `width * height` pixels)
    /// into the grid at `(x, y)` and records the region as dirty.
    ///
    /// Silently clips to the current framebuffer bounds; upstream servers
    /// are expected to never send out-of-bounds rectangles, but a clip is
    /// cheap insurance against a sliver of desync after a resize race.
    pub fn paste(&self, x: u16, y: u16, width: u16, height: u16, rgb: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let fb_width = inner.width;
        let fb_height = inner.height;
        let copy_width = width.min(fb_width.saturating_sub(x));
        let copy_height = height.min(fb_height.saturating_sub(y));
        if copy_width == 0 || copy_height == 0 {
            return;
        }
        for row in 0..copy_height {
            let src_start = usize::from(row) * usize::from(width) * 3;
            let src_end = src_start + usize::from(copy_width) * 3;
            let dst_row = usize::from(y + row) * usize::from(fb_width) + usize::from(x);
            let dst_start = dst_row * 3;
            let dst_end = dst_start + usize::from(copy_width) * 3;
            inner.pixels[dst_start..dst_end].copy_from_slice(&rgb[src_start..src_end]);
        }
        inner.dirty.push(Rect { x, y, width: copy_width, height: copy_height });
        drop(inner);
        self.dirty_signal.notify_one();
    }

    /// Applies a CopyRect: copies a `width x height` region from
    /// `(src_x, src_y)` to `(dst_x, dst_y)` within the same framebuffer.
    pub fn copy_region(&self, src_x: u16, src_y: u16, dst_x: u16, dst_y: u16, width: u16, height: u16) {
        let mut inner = self.inner.lock().unwrap();
        let fb_width = usize::from(inner.width);
        let mut block = vec![0u8; usize::from(width) * usize::from(height) * 3];
        for row in 0..height {
            let src_row = usize::from(src_y + row) * fb_width + usize::from(src_x);
            let start = src_row * 3;
            let end = start + usize::from(width) * 3;
            let block_start = usize::from(row) * usize::from(width) * 3;
            let block_end = block_start + usize::from(width) * 3;
            block[block_start..block_end].copy_from_slice(&inner.pixels[start..end]);
        }
        for row in 0..height {
            let dst_row = usize::from(dst_y + row) * fb_width + usize::from(dst_x);
            let start = dst_row * 3;
            let end = start + usize::from(width) * 3;
            let block_start = usize::from(row) * usize::from(width) * 3;
            let block_end = block_start + usize::from(width) * 3;
            inner.pixels[start..end].copy_from_slice(&block[block_start..block_end]);
        }
        inner.dirty.push(Rect { x: dst_x, y: dst_y, width, height });
        drop(inner);
        self.dirty_signal.notify_one();
    }

    /// Handles the `DesktopSize` pseudo-encoding: reallocates the grid to
    /// the new size, fills it with [`FILL_COLOR`], and clips-and-pastes the
    /// overlap of the old contents into the top-left corner. The entire new
    /// area is marked dirty.
    pub fn resize(&self, new_width: u16, new_height: u16) {
        let mut inner = self.inner.lock().unwrap();
        let mut new_pixels = filled(new_width, new_height);
        let overlap_width = new_width.min(inner.width);
        let overlap_height = new_height.min(inner.height);
        for row in 0..overlap_height {
            let old_start = (usize::from(row) * usize::from(inner.width)) * 3;
            let old_end = old_start + usize::from(overlap_width) * 3;
            let new_start = (usize::from(row) * usize::from(new_width)) * 3;
            let new_end = new_start + usize::from(overlap_width) * 3;
            new_pixels[new_start..new_end].copy_from_slice(&inner.pixels[old_start..old_end]);
        }
        inner.width = new_width;
        inner.height = new_height;
        inner.pixels = new_pixels;
        inner.dirty.clear();
        inner.dirty.push(Rect { x: 0, y: 0, width: new_width, height: new_height });
        drop(inner);
        self.dirty_signal.notify_one();
    }

    /// Atomically returns and clears the accumulated dirty log.
    pub fn take_dirty(&self) -> Vec<Rect> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.dirty)
    }

    /// Returns an independent copy of the pixels inside `bbox`, so the
    /// broadcaster can compress them without holding the framebuffer lock.
    #[must_use]
    pub fn snapshot_bbox(&self, bbox: Rect) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let fb_width = usize::from(inner.width);
        let mut out = Vec::with_capacity(usize::from(bbox.width) * usize::from(bbox.height) * 3);
        for row in 0..bbox.height {
            let src_row = usize::from(bbox.y + row) * fb_width + usize::from(bbox.x);
            let start = src_row * 3;
            let end = start + usize::from(bbox.width) * 3;
            out.extend_from_slice(&inner.pixels[start..end]);
        }
        out
    }

    /// Drains the dirty log and, if non-empty, returns its bounding box
    /// along with a snapshot of the pixels inside it.
    pub fn take_dirty_snapshot(&self) -> Option<(Rect, Vec<u8>)> {
        let dirty = self.take_dirty();
        let mut rects = dirty.into_iter();
        let mut bbox = rects.next()?;
        for rect in rects {
            bbox = bbox.union(&rect);
        }
        Some((bbox, self.snapshot_bbox(bbox)))
    }

    /// Returns a full-frame snapshot (used for the initial subscriber push
    /// and after a `request_full_frame` message).
    #[must_use]
    pub fn snapshot_full(&self) -> (Rect, Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        (
            Rect { x: 0, y: 0, width: inner.width, height: inner.height },
            inner.pixels.clone(),
        )
    }
}

fn filled(width: u16, height: u16) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(usize::from(width) * usize::from(height) * 3);
    for _ in 0..(usize::from(width) * usize::from(height)) {
        pixels.extend_from_slice(&FILL_COLOR);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_framebuffer_is_filled_with_background() {
        let fb = Framebuffer::new(2, 2);
        let (_, pixels) = fb.snapshot_full();
        assert_eq!(pixels, vec![30, 30, 30, 30, 30, 30, 30, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn paste_marks_region_dirty_and_updates_pixels() {
        let fb = Framebuffer::new(4, 4);
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 0];
        fb.paste(1, 1, 2, 2, &rgb);
        let (bbox, snapshot) = fb.take_dirty_snapshot().unwrap();
        assert_eq!(bbox, Rect { x: 1, y: 1, width: 2, height: 2 });
        assert_eq!(snapshot, rgb);
        // Draining clears the dirty log.
        assert!(fb.take_dirty_snapshot().is_none());
    }

    #[test]
    fn copy_region_duplicates_pixels() {
        let fb = Framebuffer::new(4, 4);
        let rgb = vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120];
        fb.paste(0, 0, 2, 2, &rgb);
        fb.take_dirty();
        fb.copy_region(0, 0, 2, 2, 2, 2);
        let (full, pixels) = fb.snapshot_full();
        assert_eq!(full, Rect { x: 0, y: 0, width: 4, height: 4 });
        // Bottom-right 2x2 block should now equal the top-left block.
        let row2_start = (2 * 4 + 2) * 3;
        assert_eq!(&pixels[row2_start..row2_start + 6], &rgb[0..6]);
    }

    #[test]
    fn resize_preserves_overlap_and_fills_new_area() {
        let fb = Framebuffer::new(2, 2);
        let rgb = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        fb.paste(0, 0, 2, 2, &rgb);
        fb.take_dirty();
        fb.resize(3, 3);
        let (bbox, pixels) = fb.take_dirty_snapshot().unwrap();
        assert_eq!(bbox, Rect { x: 0, y: 0, width: 3, height: 3 });
        // Top-left 2x2 overlap preserved.
        assert_eq!(&pixels[0..6], &rgb[0..6]);
        // New bottom-right corner pixel is the fill color.
        let corner = (2 * 3 + 2) * 3;
        assert_eq!(&pixels[corner..corner + 3], &FILL_COLOR);
    }

    #[test]
    fn take_dirty_drains_exactly_the_accumulated_rects() {
        let fb = Framebuffer::new(4, 4);
        let rgb = vec![0u8; 2 * 2 * 3];
        fb.paste(0, 0, 2, 2, &rgb);
        fb.paste(2, 2, 1, 1, &vec![0u8; 3]);
        let first = fb.take_dirty();
        assert_eq!(first, vec![
            Rect { x: 0, y: 0, width: 2, height: 2 },
            Rect { x: 2, y: 2, width: 1, height: 1 },
        ]);
        // Already drained; a second call with no new mutation returns empty.
        assert!(fb.take_dirty().is_empty());
    }
}

//! Folder thumbnails composed from mini thumbnails of their members
//!
//! A folder is drawn on a fixed canvas with its first few pictures laid out
//! in a grid below the folder tab. Each mini thumbnail is centred
//! horizontally in its cell and sits on the cell's bottom edge.

use crate::config::DEFAULT_THUMBNAIL_EDGE;
use crate::scale::Bound;
use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Canvas size, cell size and margins of a folder thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupLayout {
    pub canvas: Bound,
    /// Bound each member is fitted into.
    pub mini: Bound,
    /// Space reserved on the left when counting columns.
    pub left_margin: u32,
    /// Height of the folder tab above the first row.
    pub top_margin: u32,
    /// Gap between cells.
    pub margin: u32,
}

impl Default for GroupLayout {
    fn default() -> Self {
        Self {
            canvas: Bound::square(DEFAULT_THUMBNAIL_EDGE),
            mini: Bound::new(100, 75),
            left_margin: 15,
            top_margin: 65,
            margin: 10,
        }
    }
}

impl GroupLayout {
    pub fn columns(&self) -> u32 {
        self.canvas.width.saturating_sub(self.left_margin) / (self.mini.width + self.margin).max(1)
    }

    pub fn rows(&self) -> u32 {
        self.canvas.height.saturating_sub(self.top_margin) / (self.mini.height + self.margin).max(1)
    }

    /// How many members fit on the canvas.
    pub fn capacity(&self) -> usize {
        (self.columns() * self.rows()) as usize
    }

    /// Top-left corner of a `width` x `height` mini thumbnail in cell `index`.
    pub fn placement(&self, index: usize, width: u32, height: u32) -> (u32, u32) {
        let columns = self.columns().max(1);
        let column = index as u32 % columns;
        let row = index as u32 / columns;
        let x = self.margin + column * (self.mini.width + self.margin) + self.mini.width.saturating_sub(width) / 2;
        let y = self.top_margin + row * (self.mini.height + self.margin) + self.mini.height.saturating_sub(height);
        (x, y)
    }

    /// The empty folder: a tab on the top left over a body filling the rest.
    pub fn blank_canvas(&self) -> RgbImage {
        let Bound { width, height } = self.canvas;
        let background = Rgb([255, 255, 255]);
        let body = Rgb([238, 203, 120]);
        let edge = Rgb([176, 138, 60]);
        let tab_right = (width / 3).max(self.margin * 2);
        let tab_bottom = self.top_margin / 2;
        let body_top = tab_bottom.saturating_sub(self.margin / 2);

        RgbImage::from_fn(width, height, |x, y| {
            let in_tab = x >= self.margin / 2 && x < tab_right && y >= self.margin && y < tab_bottom;
            let in_body = x >= 2 && x + 2 < width && y >= body_top && y + 2 < height;
            let on_edge = in_body && (x == 2 || x + 3 == width || y == body_top || y + 3 == height);
            if on_edge {
                edge
            } else if in_tab || in_body {
                body
            } else {
                background
            }
        })
    }

    /// Draw `minis` onto a blank canvas in order. Extra minis are ignored.
    pub fn compose(&self, minis: &[RgbImage]) -> RgbImage {
        let mut canvas = self.blank_canvas();
        for (index, mini) in minis.iter().take(self.capacity()).enumerate() {
            let (x, y) = self.placement(index, mini.width(), mini.height());
            imageops::overlay(&mut canvas, mini, i64::from(x), i64::from(y));
        }
        canvas
    }
}

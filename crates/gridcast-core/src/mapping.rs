//! The replicated mapping document.
//!
//! One document describes every peer's projection surfaces: per peer, an
//! ordered list of surfaces, each a `rows x cols` grid of normalized
//! control points in source (texture) and output (screen) space. The
//! master authors the document and disseminates it as a structure
//! snapshot; point edits mutate single grid entries in between snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::protocol::GridKind;

/// `content_id` value meaning "no content bound, render the test pattern".
pub const PLACEHOLDER_CONTENT_ID: &str = "placeholder";

// =============================================================================
// Geometry
// =============================================================================

/// A normalized 2-D control point in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }
}

/// Bilinear sample of a `rows x cols` grid at normalized `(u, v)`.
fn interpolate(grid: &[Point], u: f32, v: f32, cols: usize, rows: usize) -> Point {
    let u = u.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    let colf = u * (cols - 1) as f32;
    let col1 = colf.floor() as usize;
    let col2 = (col1 + 1).min(cols - 1);
    let rowf = v * (rows - 1) as f32;
    let row1 = rowf.floor() as usize;
    let row2 = (row1 + 1).min(rows - 1);
    let uu = colf - col1 as f32;
    let vv = rowf - row1 as f32;

    let p11 = grid[row1 * cols + col1];
    let p12 = grid[row1 * cols + col2];
    let p21 = grid[row2 * cols + col1];
    let p22 = grid[row2 * cols + col2];

    let top = Point {
        x: p11.x * (1.0 - uu) + p12.x * uu,
        y: p11.y * (1.0 - uu) + p12.y * uu,
    };
    let bottom = Point {
        x: p21.x * (1.0 - uu) + p22.x * uu,
        y: p21.y * (1.0 - uu) + p22.y * uu,
    };
    Point {
        x: top.x * (1.0 - vv) + bottom.x * vv,
        y: top.y * (1.0 - vv) + bottom.y * vv,
    }
}

fn uniform_grid(rows: usize, cols: usize) -> Vec<Point> {
    let mut grid = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let v = if rows > 1 { r as f32 / (rows - 1) as f32 } else { 0.0 };
        for c in 0..cols {
            let u = if cols > 1 { c as f32 / (cols - 1) as f32 } else { 0.0 };
            grid.push(Point { x: u, y: v });
        }
    }
    grid
}

// =============================================================================
// Surfaces
// =============================================================================

/// One warped projection surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    /// Unique within the owning peer.
    pub id: String,
    /// References an entry in the content set, or [`PLACEHOLDER_CONTENT_ID`].
    pub content_id: String,
    pub rows: usize,
    pub cols: usize,
    /// Texture-space control points, `rows * cols` entries.
    pub source_grid: Vec<Point>,
    /// Screen-space control points, `rows * cols` entries.
    pub output_grid: Vec<Point>,
}

impl Surface {
    /// A fresh surface with uniform grids. Minimum geometry is 2x2.
    pub fn new(id: impl Into<String>, rows: usize, cols: usize) -> Self {
        let rows = rows.max(2);
        let cols = cols.max(2);
        Self {
            id: id.into(),
            content_id: PLACEHOLDER_CONTENT_ID.to_string(),
            rows,
            cols,
            source_grid: uniform_grid(rows, cols),
            output_grid: uniform_grid(rows, cols),
        }
    }

    /// True when both grids carry exactly `rows * cols` points.
    pub fn geometry_is_valid(&self) -> bool {
        self.rows >= 2
            && self.cols >= 2
            && self.source_grid.len() == self.rows * self.cols
            && self.output_grid.len() == self.rows * self.cols
    }

    /// Rebuild both grids as uniform, keeping id/content binding. Used to
    /// repair surfaces whose serialized grids disagree with their geometry.
    fn repair_geometry(&mut self) {
        self.rows = self.rows.max(2);
        self.cols = self.cols.max(2);
        self.source_grid = uniform_grid(self.rows, self.cols);
        self.output_grid = uniform_grid(self.rows, self.cols);
    }

    /// Change the grid resolution, resampling both grids bilinearly so the
    /// warp shape is preserved.
    pub fn set_divisions(&mut self, rows: usize, cols: usize) {
        let rows = rows.max(2);
        let cols = cols.max(2);
        if rows == self.rows && cols == self.cols {
            return;
        }
        let resample = |grid: &[Point]| {
            let mut out = Vec::with_capacity(rows * cols);
            for r in 0..rows {
                let v = r as f32 / (rows - 1) as f32;
                for c in 0..cols {
                    let u = c as f32 / (cols - 1) as f32;
                    out.push(interpolate(grid, u, v, self.cols, self.rows));
                }
            }
            out
        };
        self.source_grid = resample(&self.source_grid);
        self.output_grid = resample(&self.output_grid);
        self.rows = rows;
        self.cols = cols;
    }

    fn grid_mut(&mut self, kind: GridKind) -> &mut Vec<Point> {
        match kind {
            GridKind::Source => &mut self.source_grid,
            GridKind::Output => &mut self.output_grid,
        }
    }

    pub fn grid(&self, kind: GridKind) -> &[Point] {
        match kind {
            GridKind::Source => &self.source_grid,
            GridKind::Output => &self.output_grid,
        }
    }
}

// =============================================================================
// Document
// =============================================================================

/// Surfaces owned by one peer, in draw order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PeerMapping {
    pub surfaces: Vec<Surface>,
}

/// The full replicated document: peer id -> that peer's surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MappingDocument {
    pub peers: BTreeMap<String, PeerMapping>,
}

impl MappingDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document with a parsed snapshot.
    ///
    /// Surfaces whose id already exists under the same peer keep their
    /// object identity (fields are updated in place); unknown ids are
    /// inserted, missing ids dropped, the same keep-set the master
    /// applied. A parse failure leaves the current document untouched.
    pub fn apply_snapshot(&mut self, json: &[u8]) -> Result<()> {
        let incoming: MappingDocument = serde_json::from_slice(json)?;

        let mut peers = BTreeMap::new();
        for (peer_id, incoming_mapping) in incoming.peers {
            let mut existing = self.peers.remove(&peer_id).unwrap_or_default();
            let mut surfaces = Vec::with_capacity(incoming_mapping.surfaces.len());
            for mut incoming_surface in incoming_mapping.surfaces {
                if !incoming_surface.geometry_is_valid() {
                    debug!(
                        peer = %peer_id,
                        surface = %incoming_surface.id,
                        "snapshot surface has inconsistent grids, rebuilding uniform"
                    );
                    incoming_surface.repair_geometry();
                }
                match existing
                    .surfaces
                    .iter()
                    .position(|s| s.id == incoming_surface.id)
                {
                    Some(pos) => {
                        let mut kept = existing.surfaces.remove(pos);
                        kept.content_id = incoming_surface.content_id;
                        kept.rows = incoming_surface.rows;
                        kept.cols = incoming_surface.cols;
                        kept.source_grid = incoming_surface.source_grid;
                        kept.output_grid = incoming_surface.output_grid;
                        surfaces.push(kept);
                    }
                    None => surfaces.push(incoming_surface),
                }
            }
            peers.insert(peer_id, PeerMapping { surfaces });
        }
        self.peers = peers;
        Ok(())
    }

    /// Move one control point. Unknown owner, out-of-range surface or point
    /// indices are no-ops; coordinates are clamped to `[0, 1]`. Returns
    /// whether anything changed.
    pub fn apply_point_edit(
        &mut self,
        owner: &str,
        surface_index: usize,
        grid: GridKind,
        point_index: usize,
        x: f32,
        y: f32,
    ) -> bool {
        let Some(mapping) = self.peers.get_mut(owner) else {
            return false;
        };
        let Some(surface) = mapping.surfaces.get_mut(surface_index) else {
            return false;
        };
        let points = surface.grid_mut(grid);
        let Some(point) = points.get_mut(point_index) else {
            return false;
        };
        *point = Point::new(x, y);
        true
    }

    /// Snapshot JSON suitable for a STRUCTURE_SNAPSHOT frame.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

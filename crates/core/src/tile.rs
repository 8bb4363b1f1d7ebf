use crate::error::EngineError;

/// One tile of the overlapping tile grid. Source coordinates are in input
/// pixels, destination coordinates in output pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub source_x: usize,
    pub source_y: usize,
    pub source_width: usize,
    pub source_height: usize,
    pub dest_x: usize,
    pub dest_y: usize,
    pub dest_width: usize,
    pub dest_height: usize,
    pub is_left_edge: bool,
    pub is_right_edge: bool,
    pub is_top_edge: bool,
    pub is_bottom_edge: bool,
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    pub tiles: Vec<Tile>,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileGrid {
    /// Lays out overlapping tiles over `frame_width` x `frame_height`.
    ///
    /// Tiles advance by `tile - overlap`; the last tile per axis is pulled
    /// inward so it ends exactly at the frame border instead of spilling
    /// past it. Tiles are emitted row-major, left to right then top to
    /// bottom.
    pub fn compute(
        frame_width: usize,
        frame_height: usize,
        tile_width: usize,
        tile_height: usize,
        overlap: usize,
        user_scale: f64,
    ) -> Result<Self, EngineError> {
        if frame_width == 0 || frame_height == 0 {
            return Err(EngineError::invalid_configuration(
                "frame dimensions must be non-zero",
            ));
        }
        if tile_width == 0 || tile_height == 0 {
            return Err(EngineError::invalid_configuration(
                "tile dimensions must be non-zero",
            ));
        }
        if overlap >= tile_width || overlap >= tile_height {
            return Err(EngineError::invalid_configuration(format!(
                "overlap {overlap} must be smaller than tile size {tile_width}x{tile_height}"
            )));
        }
        if !(user_scale.is_finite() && user_scale > 0.0) {
            return Err(EngineError::invalid_configuration(format!(
                "scale factor {user_scale} must be a positive finite number"
            )));
        }

        let xs = axis_origins(frame_width, tile_width, overlap);
        let ys = axis_origins(frame_height, tile_height, overlap);
        let tiles_x = xs.len();
        let tiles_y = ys.len();

        let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
        for (row, &source_y) in ys.iter().enumerate() {
            let source_height = tile_height.min(frame_height - source_y);
            let (dest_y, dest_height) = scale_span(source_y, source_height, user_scale);

            for (col, &source_x) in xs.iter().enumerate() {
                let source_width = tile_width.min(frame_width - source_x);
                let (dest_x, dest_width) = scale_span(source_x, source_width, user_scale);

                tiles.push(Tile {
                    source_x,
                    source_y,
                    source_width,
                    source_height,
                    dest_x,
                    dest_y,
                    dest_width,
                    dest_height,
                    is_left_edge: col == 0,
                    is_right_edge: col == tiles_x - 1,
                    is_top_edge: row == 0,
                    is_bottom_edge: row == tiles_y - 1,
                });
            }
        }

        tracing::debug!(
            frame_width,
            frame_height,
            tiles_x,
            tiles_y,
            "Computed tile grid"
        );
        Ok(Self {
            tiles,
            tiles_x,
            tiles_y,
        })
    }
}

fn axis_origins(frame_dim: usize, tile_dim: usize, overlap: usize) -> Vec<usize> {
    let effective = tile_dim - overlap;
    let covered = frame_dim.saturating_sub(overlap);
    let count = covered.div_ceil(effective).max(1);

    (0..count)
        .map(|index| {
            let origin = index * effective;
            origin.min(frame_dim.saturating_sub(tile_dim))
        })
        .collect()
}

/// Maps a source span to output pixels so adjacent spans tile exactly,
/// even for fractional scale factors.
fn scale_span(origin: usize, length: usize, scale: f64) -> (usize, usize) {
    let start = (origin as f64 * scale).floor() as usize;
    let end = ((origin + length) as f64 * scale).floor() as usize;
    (start, end.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hd_frame_with_512_tiles_pulls_last_column_inward() {
        let grid = TileGrid::compute(1920, 1080, 512, 512, 16, 2.0).expect("grid");

        assert_eq!(grid.tiles_x, 4);
        let first_row: Vec<usize> = grid.tiles[..grid.tiles_x]
            .iter()
            .map(|tile| tile.source_x)
            .collect();
        assert_eq!(first_row, vec![0, 496, 992, 1408]);

        for tile in &grid.tiles[..grid.tiles_x] {
            assert_eq!(tile.source_width, 512);
        }
    }

    #[test]
    fn frame_smaller_than_tile_yields_single_full_frame_tile() {
        let grid = TileGrid::compute(300, 200, 512, 512, 16, 2.0).expect("grid");

        assert_eq!(grid.tiles.len(), 1);
        let tile = &grid.tiles[0];
        assert_eq!((tile.source_x, tile.source_y), (0, 0));
        assert_eq!((tile.source_width, tile.source_height), (300, 200));
        assert!(tile.is_left_edge && tile.is_right_edge);
        assert!(tile.is_top_edge && tile.is_bottom_edge);
        assert_eq!((tile.dest_width, tile.dest_height), (600, 400));
    }

    #[test]
    fn overlap_equal_to_tile_size_is_rejected() {
        let result = TileGrid::compute(1920, 1080, 64, 64, 64, 2.0);
        assert!(matches!(
            result,
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn tiles_are_emitted_row_major() {
        let grid = TileGrid::compute(200, 200, 128, 128, 16, 2.0).expect("grid");
        assert_eq!(grid.tiles_x, 2);
        assert_eq!(grid.tiles_y, 2);

        let order: Vec<(usize, usize)> = grid
            .tiles
            .iter()
            .map(|tile| (tile.source_x, tile.source_y))
            .collect();
        assert_eq!(order, vec![(0, 0), (72, 0), (0, 72), (72, 72)]);
    }

    #[test]
    fn edge_flags_only_on_border_tiles() {
        let grid = TileGrid::compute(400, 400, 128, 128, 16, 2.0).expect("grid");
        assert!(grid.tiles_x >= 3);

        for tile in &grid.tiles {
            assert_eq!(tile.is_left_edge, tile.source_x == 0);
            assert_eq!(tile.is_top_edge, tile.source_y == 0);
            assert_eq!(
                tile.is_right_edge,
                tile.source_x + tile.source_width == 400
            );
            assert_eq!(
                tile.is_bottom_edge,
                tile.source_y + tile.source_height == 400
            );
        }
    }

    #[test]
    fn destination_spans_cover_output_without_gaps() {
        // Fractional scale stresses the rounding of destination spans.
        let grid = TileGrid::compute(1000, 10, 256, 256, 32, 1.5).expect("grid");

        let mut covered = vec![false; 1500];
        for tile in &grid.tiles {
            if !tile.is_top_edge {
                continue;
            }
            for x in tile.dest_x..tile.dest_x + tile.dest_width {
                covered[x] = true;
            }
        }
        assert!(covered.iter().all(|&hit| hit), "output column left uncovered");
    }

    #[test]
    fn every_source_pixel_is_covered() {
        let grid = TileGrid::compute(1920, 1080, 512, 512, 16, 2.0).expect("grid");

        let mut covered = vec![false; 1920];
        for tile in grid.tiles.iter().filter(|tile| tile.is_top_edge) {
            for x in tile.source_x..tile.source_x + tile.source_width {
                covered[x] = true;
            }
        }
        assert!(covered.iter().all(|&hit| hit));
    }
}

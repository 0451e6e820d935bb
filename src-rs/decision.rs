use serde::Serialize;

use crate::tiles::{DiffResult, TileRect};

/// Aggregate outcome of one comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub changed: bool,
    pub changed_tile_count: usize,
    /// Sum of the pixel areas of the changed tiles.
    pub changed_area: u64,
    /// Union of the changed tile rectangles.
    pub bounds: Option<TileRect>,
}

/// Folds the per-tile classification into a single change decision.
pub fn decide(result: &DiffResult) -> ChangeSummary {
    let mut changed_tile_count = 0;
    let mut changed_area = 0u64;
    let mut bounds: Option<TileRect> = None;

    for tile in result.changed_tiles() {
        changed_tile_count += 1;
        changed_area += tile.rect.area();
        bounds = Some(match bounds {
            Some(b) => b.union(&tile.rect),
            None => tile.rect,
        });
    }

    ChangeSummary {
        changed: result.has_changes,
        changed_tile_count,
        changed_area,
        bounds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffConfig;
    use crate::tiles::diff;
    use crate::tiles::tests::{red_block_pair, solid, WHITE};

    #[test]
    fn summarizes_changed_tiles() {
        let (before, after) = red_block_pair();
        let result = diff(&before, &after, &DiffConfig::new(30, 50, 100, 0.35).unwrap()).unwrap();
        let summary = decide(&result);

        assert!(summary.changed);
        assert_eq!(summary.changed_tile_count, 4);
        assert_eq!(summary.changed_area, 4 * 2500);
        assert_eq!(
            summary.bounds,
            Some(TileRect {
                x: 50,
                y: 50,
                w: 100,
                h: 100
            })
        );
    }

    #[test]
    fn unchanged_result_has_empty_summary() {
        let image = solid(30, 30, WHITE);
        let result = diff(&image, &image, &DiffConfig::default()).unwrap();
        let summary = decide(&result);
        assert_eq!(
            summary,
            ChangeSummary {
                changed: false,
                changed_tile_count: 0,
                changed_area: 0,
                bounds: None,
            }
        );
    }
}

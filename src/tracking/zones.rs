// SPDX-License-Identifier: Apache-2.0

use super::TrackerError;

/// Maximum number of ignore zones.
pub const MAX_IGNORE_ZONES: usize = 10;

/// Maximum number of polygon vertices per ignore zone.
pub const MAX_VERTICES: usize = 10;

/// Polygon on the ground plane whose targets are not tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoreZone {
    pub active: bool,
    vertices: Vec<[f32; 2]>,
    min: [f32; 2],
    max: [f32; 2],
}

impl IgnoreZone {
    /// Builds an active zone from at least three vertices in meters.
    pub fn new(vertices: &[[f32; 2]]) -> Result<IgnoreZone, TrackerError> {
        if vertices.len() > MAX_VERTICES {
            return Err(TrackerError::StructSize {
                expected: MAX_VERTICES,
                actual: vertices.len(),
            });
        }

        if vertices.len() < 3 {
            return Err(TrackerError::Parameter(format!(
                "ignore zone needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }

        if vertices.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TrackerError::Parameter(
                "ignore zone vertex is not finite".to_string(),
            ));
        }

        let mut min = [f32::MAX; 2];
        let mut max = [f32::MIN; 2];
        for v in vertices {
            for i in 0..2 {
                min[i] = min[i].min(v[i]);
                max[i] = max[i].max(v[i]);
            }
        }

        Ok(IgnoreZone {
            active: true,
            vertices: vertices.to_vec(),
            min,
            max,
        })
    }

    #[inline]
    pub fn vertices(&self) -> &[[f32; 2]] {
        &self.vertices
    }

    /// Returns true if the point lies inside an active zone.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        if !self.active {
            return false;
        }

        if x < self.min[0] || x > self.max[0] || y < self.min[1] || y > self.max[1] {
            return false;
        }

        // Even-odd ray casting along +x.
        let mut inside = false;
        let n = self.vertices.len();
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.vertices[i];
            let [xj, yj] = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

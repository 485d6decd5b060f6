//! Smooth node mobility over cubic Bezier paths.
//!
//! Each mobile node follows a Bezier curve toward a random destination at a
//! speed drawn once per path segment; when the destination is reached a new
//! curve is generated from there. Motion is continuous across steps.

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

fn bezier_point(p: &[Position; 4], t: f64) -> Position {
    let u = 1.0 - t;
    let w = [u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t];
    Position {
        x: w.iter().zip(p.iter()).map(|(w, p)| w * p.x).sum(),
        y: w.iter().zip(p.iter()).map(|(w, p)| w * p.y).sum(),
    }
}

/// Per-node path state, owned by the node, advanced by [`SmoothMobility`].
#[derive(Debug, Clone)]
pub struct MobilityState {
    control_points: [Position; 4],
    progress: f64,
    duration: f64,
    speed: f64,
}

#[derive(Debug, Clone)]
pub struct SmoothMobility {
    area_size: f64,
    min_speed: f64,
    max_speed: f64,
}

/// Segments used for the polyline approximation of a curve's length.
const LENGTH_STEPS: usize = 20;

impl SmoothMobility {
    pub fn new(area_size: f64, min_speed: f64, max_speed: f64) -> Self {
        SmoothMobility { area_size, min_speed, max_speed }
    }

    /// Fresh path starting at `from`, with the segment speed sampled once.
    pub fn assign<R: Rng>(&self, from: Position, rng: &mut R) -> MobilityState {
        let speed = rng.gen_range(self.min_speed..=self.max_speed);
        let control_points = self.generate_path(from, rng);
        MobilityState {
            duration: approx_length(&control_points) / speed,
            control_points,
            progress: 0.0,
            speed,
        }
    }

    fn generate_path<R: Rng>(&self, start: Position, rng: &mut R) -> [Position; 4] {
        let dest = Position {
            x: rng.gen_range(0.0..self.area_size),
            y: rng.gen_range(0.0..self.area_size),
        };
        let wobble = self.area_size * 0.1;
        let off = Position {
            x: (rng.gen::<f64>() - 0.5) * wobble,
            y: (rng.gen::<f64>() - 0.5) * wobble,
        };
        let cp1 = Position {
            x: start.x + (dest.x - start.x) / 3.0 + off.x,
            y: start.y + (dest.y - start.y) / 3.0 + off.y,
        };
        let cp2 = Position {
            x: start.x + 2.0 * (dest.x - start.x) / 3.0 - off.x,
            y: start.y + 2.0 * (dest.y - start.y) / 3.0 - off.y,
        };
        [start, cp1, cp2, dest]
    }

    /// Advance a node by `dt` seconds, regenerating the path whenever the
    /// current destination is reached. Returns the new position.
    pub fn advance<R: Rng>(&self, state: &mut MobilityState, dt: f64, rng: &mut R) -> Position {
        if dt <= 0.0 || state.duration <= 0.0 {
            return bezier_point(&state.control_points, state.progress);
        }
        state.progress += dt / state.duration;
        while state.progress >= 1.0 {
            let reached = state.control_points[3];
            state.progress -= 1.0;
            state.control_points = self.generate_path(reached, rng);
            state.speed = rng.gen_range(self.min_speed..=self.max_speed);
            state.duration = approx_length(&state.control_points) / state.speed;
        }
        bezier_point(&state.control_points, state.progress)
    }
}

fn approx_length(points: &[Position; 4]) -> f64 {
    let mut prev = bezier_point(points, 0.0);
    let mut length = 0.0;
    for i in 1..=LENGTH_STEPS {
        let pos = bezier_point(points, i as f64 / LENGTH_STEPS as f64);
        length += prev.distance(&pos);
        prev = pos;
    }
    length.max(f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn motion_is_continuous() {
        let model = SmoothMobility::new(1000.0, 2.0, 10.0);
        let mut rng = StdRng::seed_from_u64(11);
        let start = Position { x: 500.0, y: 500.0 };
        let mut state = model.assign(start, &mut rng);
        let mut prev = start;
        for _ in 0..200 {
            let pos = model.advance(&mut state, 1.0, &mut rng);
            // Bezier arc speed is not uniform, but one step at <= 10 m/s
            // cannot teleport across the area.
            assert!(prev.distance(&pos) < 60.0);
            prev = pos;
        }
    }

    #[test]
    fn path_starts_where_the_node_is() {
        let model = SmoothMobility::new(1000.0, 2.0, 5.0);
        let mut rng = StdRng::seed_from_u64(3);
        let start = Position { x: 10.0, y: 20.0 };
        let mut state = model.assign(start, &mut rng);
        let first = model.advance(&mut state, 1e-9, &mut rng);
        assert!(start.distance(&first) < 1e-3);
    }
}

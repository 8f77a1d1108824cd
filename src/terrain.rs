// src/terrain.rs
//
// Terrain ray intersection against a digital elevation model.
//
// A ray is marched from the device position through a local East-North-Up
// frame at a fixed coarse interval; the first step where the ray falls to or
// below the terrain surface brackets the crossing, which is then refined by
// fixed-count bisection. If no crossing occurs within the requested range
// the cast returns nothing — that absence is the sole safety mechanism. No
// conservative pitch restriction is layered on top: an upward-pitched ray
// must be able to climb into rising terrain for over-ridge targeting, so
// only rays aimed well into open sky (more than the configured angle above
// horizontal) are rejected outright.
//
// ENU→geographic conversion uses the small-angle approximation (constant
// meters per degree of latitude, longitude scaled by cos(lat)). The error is
// marginal at these ranges even at high latitude; a full geodesic conversion
// was considered and deliberately not adopted.
//
// Elevation lookups may involve tile I/O and are owned by the provider;
// callers run casts off the per-frame critical path and publish results as
// candidates. A tile miss mid-march aborts the cast for this attempt.

use serde::{Deserialize, Serialize};
use tracing::debug;

const METERS_PER_DEG_LAT: f64 = 111_320.0;

// ============================================================================
// COLLABORATOR INTERFACE
// ============================================================================

/// Answers bilinearly-interpolated elevation queries. Owns its own tile
/// cache and eviction; may report unavailable (no fix, tile miss).
pub trait ElevationProvider {
    fn elevation_m(&self, lat_deg: f64, lon_deg: f64) -> Option<f64>;
}

// ============================================================================
// CONFIGURATION & TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Coarse march interval along the ray.
    pub step_m: f64,
    /// Bisection iterations refining a bracketed crossing.
    /// Final positional accuracy ≈ step / 2^iterations.
    pub bisection_iters: u32,
    /// Rays aimed more than this above horizontal are not marched.
    pub max_pitch_above_horizontal_deg: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            step_m: 30.0,
            bisection_iters: 5,
            max_pitch_above_horizontal_deg: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TerrainHit {
    pub distance_m: f64,
    pub lat_deg: f64,
    pub lon_deg: f64,
}

// ============================================================================
// RAY CASTER
// ============================================================================

/// Stateless across calls; all tile state lives in the provider.
#[derive(Debug, Clone)]
pub struct TerrainRayCaster {
    config: TerrainConfig,
}

struct Ray {
    origin: GeoPosition,
    east: f64,
    north: f64,
    up: f64,
    cos_lat: f64,
}

impl Ray {
    /// Geographic position and ray altitude at distance `t` along the ray.
    fn at(&self, t: f64) -> (f64, f64, f64) {
        let lat = self.origin.lat_deg + (self.north * t) / METERS_PER_DEG_LAT;
        let lon = self.origin.lon_deg + (self.east * t) / (METERS_PER_DEG_LAT * self.cos_lat);
        let alt = self.origin.alt_m + self.up * t;
        (lat, lon, alt)
    }
}

impl TerrainRayCaster {
    pub fn new(config: TerrainConfig) -> Self {
        Self { config }
    }

    /// March a ray from `origin` and return the first terrain crossing
    /// within `max_range_m`, or None (no crossing, invalid pitch, or
    /// elevation unavailable).
    ///
    /// `pitch_below_horizontal_deg` is positive looking down; negative
    /// values look above the horizon (bounded by config). `heading_deg` is
    /// clockwise from true north.
    pub fn intersect<P: ElevationProvider>(
        &self,
        provider: &P,
        origin: GeoPosition,
        pitch_below_horizontal_deg: f64,
        heading_deg: f64,
        max_range_m: f64,
    ) -> Option<TerrainHit> {
        if pitch_below_horizontal_deg < -self.config.max_pitch_above_horizontal_deg
            || pitch_below_horizontal_deg > 90.0
        {
            debug!(
                "🗻 Ray rejected: pitch {:.1}° outside usable band",
                pitch_below_horizontal_deg
            );
            return None;
        }
        if max_range_m <= 0.0 {
            return None;
        }

        let pitch = pitch_below_horizontal_deg.to_radians();
        let heading = heading_deg.to_radians();
        let cos_pitch = pitch.cos();

        let ray = Ray {
            origin,
            east: heading.sin() * cos_pitch,
            north: heading.cos() * cos_pitch,
            // Positive when looking above the horizon, so the ray can climb
            // into rising terrain.
            up: -pitch.sin(),
            cos_lat: origin.lat_deg.to_radians().cos().max(1e-6),
        };

        // ── COARSE MARCH ────────────────────────────────────────
        let mut prev_t = 0.0f64;
        let mut prev_above = {
            let (lat, lon, alt) = ray.at(0.0);
            let elev = provider.elevation_m(lat, lon)?;
            alt > elev
        };

        let mut t = self.config.step_m;
        while t <= max_range_m {
            let (lat, lon, alt) = ray.at(t);
            let elev = provider.elevation_m(lat, lon)?;
            let above = alt > elev;

            if prev_above && !above {
                return Some(self.refine(provider, &ray, prev_t, t));
            }

            prev_above = above;
            prev_t = t;
            t += self.config.step_m;
        }

        None
    }

    /// Bisect the bracketing interval, halving it each iteration.
    fn refine<P: ElevationProvider>(&self, provider: &P, ray: &Ray, lo0: f64, hi0: f64) -> TerrainHit {
        let mut lo = lo0;
        let mut hi = hi0;

        for _ in 0..self.config.bisection_iters {
            let mid = 0.5 * (lo + hi);
            let (lat, lon, alt) = ray.at(mid);
            match provider.elevation_m(lat, lon) {
                Some(elev) if alt > elev => lo = mid,
                Some(_) => hi = mid,
                // Tile dropped out mid-refinement: keep the bracket we have.
                None => break,
            }
        }

        let t = 0.5 * (lo + hi);
        let (lat, lon, _) = ray.at(t);
        TerrainHit {
            distance_m: t,
            lat_deg: lat,
            lon_deg: lon,
        }
    }
}

/// Confidence for a terrain hit, owned by the caller rather than the cast:
/// each degraded input shifts the displayed confidence down without
/// changing the ray answer itself.
pub fn hit_confidence(
    horizontal_accuracy_m: f64,
    heading_accuracy_deg: f64,
    vertical_accuracy_m: f64,
    hit_distance_m: f64,
) -> f32 {
    let cross_range_m = hit_distance_m * heading_accuracy_deg.to_radians().tan().abs();

    let f_horizontal = 1.0 / (1.0 + horizontal_accuracy_m.max(0.0) / 10.0);
    let f_heading = 1.0 / (1.0 + cross_range_m / 50.0);
    let f_vertical = 1.0 / (1.0 + vertical_accuracy_m.max(0.0) / 20.0);
    let f_distance = 1.0 / (1.0 + hit_distance_m.max(0.0) / 3000.0);

    (0.95 * f_horizontal * f_heading * f_vertical * f_distance).clamp(0.0, 1.0) as f32
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat terrain at a fixed elevation.
    struct FlatTerrain(f64);

    impl ElevationProvider for FlatTerrain {
        fn elevation_m(&self, _lat: f64, _lon: f64) -> Option<f64> {
            Some(self.0)
        }
    }

    /// Terrain rising to the north at a fixed grade from a reference
    /// latitude; used for upward-looking over-ridge rays.
    struct RisingTerrain {
        lat0_deg: f64,
        grade: f64,
    }

    impl ElevationProvider for RisingTerrain {
        fn elevation_m(&self, lat: f64, _lon: f64) -> Option<f64> {
            let north_m = (lat - self.lat0_deg) * METERS_PER_DEG_LAT;
            Some(self.grade * north_m.max(0.0))
        }
    }

    struct NoFix;

    impl ElevationProvider for NoFix {
        fn elevation_m(&self, _lat: f64, _lon: f64) -> Option<f64> {
            None
        }
    }

    fn caster() -> TerrainRayCaster {
        TerrainRayCaster::new(TerrainConfig::default())
    }

    fn origin(alt: f64) -> GeoPosition {
        GeoPosition {
            lat_deg: 46.5,
            lon_deg: 8.0,
            alt_m: alt,
        }
    }

    #[test]
    fn test_flat_terrain_bisection_accuracy() {
        let caster = caster();
        let terrain = FlatTerrain(0.0);

        // 30° down from 1000 m: crossing at t = 1000 / sin(30°) = 2000 m.
        let hit = caster
            .intersect(&terrain, origin(1000.0), 30.0, 0.0, 3000.0)
            .expect("should intersect flat terrain");

        let cfg = TerrainConfig::default();
        let tolerance = cfg.step_m / 2f64.powi(cfg.bisection_iters as i32);
        assert!(
            (hit.distance_m - 2000.0).abs() <= tolerance,
            "hit at {:.2} m, analytic 2000 m, tol {:.3}",
            hit.distance_m,
            tolerance
        );
    }

    #[test]
    fn test_hit_coordinates_track_heading() {
        let caster = caster();
        let terrain = FlatTerrain(0.0);
        let o = origin(500.0);

        // Due east, 45° down: crossing at ~707 m, lat unchanged, lon east.
        let hit = caster
            .intersect(&terrain, o, 45.0, 90.0, 2000.0)
            .expect("should intersect");

        assert!((hit.lat_deg - o.lat_deg).abs() < 1e-6);
        assert!(hit.lon_deg > o.lon_deg);
    }

    #[test]
    fn test_upward_ray_climbs_into_rising_terrain() {
        let caster = caster();
        let o = origin(100.0);
        let terrain = RisingTerrain {
            lat0_deg: o.lat_deg,
            grade: 0.2,
        };

        // 3° ABOVE horizontal, due north: ray climbs at sin(3°) while the
        // terrain rises at 20% of northing. Analytic crossing:
        //   100 + sin(3°)·t = 0.2·cos(3°)·t
        let up = 3f64.to_radians().sin();
        let north = 3f64.to_radians().cos();
        let analytic = 100.0 / (0.2 * north - up);

        let hit = caster
            .intersect(&terrain, o, -3.0, 0.0, 3000.0)
            .expect("upward ray must still reach rising terrain");

        let cfg = TerrainConfig::default();
        let tolerance = cfg.step_m / 2f64.powi(cfg.bisection_iters as i32);
        assert!(
            (hit.distance_m - analytic).abs() <= tolerance,
            "hit {:.2} m vs analytic {:.2} m",
            hit.distance_m,
            analytic
        );
    }

    #[test]
    fn test_sky_pitch_rejected() {
        let caster = caster();
        let terrain = FlatTerrain(0.0);
        // 45° above horizontal — beyond the usable band.
        assert!(caster
            .intersect(&terrain, origin(1000.0), -45.0, 0.0, 3000.0)
            .is_none());
    }

    #[test]
    fn test_no_crossing_within_range() {
        let caster = caster();
        let terrain = FlatTerrain(0.0);
        // Shallow 3° down from 1000 m needs ~19 km; range only allows 5 km.
        assert!(caster
            .intersect(&terrain, origin(1000.0), 3.0, 0.0, 5000.0)
            .is_none());
    }

    #[test]
    fn test_elevation_unavailable_returns_none() {
        let caster = caster();
        assert!(caster
            .intersect(&NoFix, origin(1000.0), 30.0, 0.0, 3000.0)
            .is_none());
    }

    #[test]
    fn test_hit_confidence_degrades_with_inputs() {
        let good = hit_confidence(3.0, 0.5, 5.0, 800.0);
        let bad_gps = hit_confidence(50.0, 0.5, 5.0, 800.0);
        let bad_heading = hit_confidence(3.0, 5.0, 5.0, 800.0);
        let farther = hit_confidence(3.0, 0.5, 5.0, 5000.0);

        assert!(good > bad_gps);
        assert!(good > bad_heading);
        assert!(good > farther);
        assert!(good > 0.0 && good <= 1.0);
    }
}

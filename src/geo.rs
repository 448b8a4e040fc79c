use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Mean Earth radius in nautical miles, used by the haversine fast path.
const EARTH_RADIUS_NM: f64 = 3440.07;

/// WGS-84 semi-major axis in nautical miles.
const SEMI_MAJOR_NM: f64 = 3443.918;
/// WGS-84 semi-minor axis in nautical miles.
const SEMI_MINOR_NM: f64 = 3432.3716599595;
/// WGS-84 flattening.
const FLATTENING: f64 = 1.0 / 298.257223563;

/// Convergence tolerance for the Vincenty iterations.
const CONVERGENCE: f64 = 1e-9;
/// Iteration cap for the inverse solution (nearly-antipodal points diverge).
const MAX_ITERATIONS: usize = 100;

/// A point on the WGS-84 ellipsoid in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in nautical miles (haversine).
    ///
    /// Cheaper than the Vincenty inverse and accurate enough for screen
    /// culling and proximity checks.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_NM * c
    }

    /// Vincenty direct solution: the point `distance` nautical miles from
    /// here along the initial `bearing` (true degrees).
    pub fn fix_radial_distance(&self, bearing: f64, distance: f64) -> Coordinate {
        if distance == 0.0 {
            return *self;
        }

        let alpha1 = bearing.to_radians();
        let sin_alpha1 = alpha1.sin();
        let cos_alpha1 = alpha1.cos();

        let tan_u1 = (1.0 - FLATTENING) * self.latitude.to_radians().tan();
        let cos_u1 = 1.0 / (1.0 + tan_u1 * tan_u1).sqrt();
        let sin_u1 = tan_u1 * cos_u1;

        let sigma1 = tan_u1.atan2(cos_alpha1);
        let sin_alpha = cos_u1 * sin_alpha1;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        let u_sq = cos_sq_alpha * (SEMI_MAJOR_NM * SEMI_MAJOR_NM - SEMI_MINOR_NM * SEMI_MINOR_NM)
            / (SEMI_MINOR_NM * SEMI_MINOR_NM);
        let a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
        let b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));

        let mut sigma = distance / (SEMI_MINOR_NM * a);
        let mut cos_2sigma_m;
        let mut sin_sigma;
        let mut cos_sigma;

        loop {
            cos_2sigma_m = (2.0 * sigma1 + sigma).cos();
            sin_sigma = sigma.sin();
            cos_sigma = sigma.cos();

            let delta_sigma = b
                * sin_sigma
                * (cos_2sigma_m
                    + b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                            - b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                                * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
            let next = distance / (SEMI_MINOR_NM * a) + delta_sigma;
            let done = (next - sigma).abs() < CONVERGENCE;
            sigma = next;
            if done {
                break;
            }
        }

        cos_2sigma_m = (2.0 * sigma1 + sigma).cos();
        sin_sigma = sigma.sin();
        cos_sigma = sigma.cos();

        let tmp = sin_u1 * sin_sigma - cos_u1 * cos_sigma * cos_alpha1;
        let lat2 = (sin_u1 * cos_sigma + cos_u1 * sin_sigma * cos_alpha1)
            .atan2((1.0 - FLATTENING) * (sin_alpha * sin_alpha + tmp * tmp).sqrt());
        let lambda = (sin_sigma * sin_alpha1).atan2(cos_u1 * cos_sigma - sin_u1 * sin_sigma * cos_alpha1);
        let c = FLATTENING / 16.0 * cos_sq_alpha * (4.0 + FLATTENING * (4.0 - 3.0 * cos_sq_alpha));
        let l = lambda
            - (1.0 - c)
                * FLATTENING
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        Coordinate {
            latitude: lat2.to_degrees(),
            longitude: self.longitude + l.to_degrees(),
        }
    }

    /// Vincenty inverse solution: `(initial bearing, distance NM)` to `other`.
    ///
    /// The bearing is `None` when the points coincide, and also when the
    /// azimuth fails to converge even though the distance does (nearly
    /// antipodal points).
    pub fn bearing_distance_to(&self, other: &Coordinate) -> (Option<f64>, f64) {
        let l = (other.longitude - self.longitude).to_radians();
        let tan_u1 = (1.0 - FLATTENING) * self.latitude.to_radians().tan();
        let cos_u1 = 1.0 / (1.0 + tan_u1 * tan_u1).sqrt();
        let sin_u1 = tan_u1 * cos_u1;
        let tan_u2 = (1.0 - FLATTENING) * other.latitude.to_radians().tan();
        let cos_u2 = 1.0 / (1.0 + tan_u2 * tan_u2).sqrt();
        let sin_u2 = tan_u2 * cos_u2;

        let mut lambda = l;
        let mut iterations = 0;
        let mut converged = false;

        let mut sin_sigma = 0.0;
        let mut cos_sigma = 0.0;
        let mut sigma = 0.0;
        let mut cos_sq_alpha = 0.0;
        let mut cos_2sigma_m = 0.0;
        let mut sin_lambda = 0.0;
        let mut cos_lambda = 0.0;

        while iterations < MAX_ITERATIONS {
            iterations += 1;
            sin_lambda = lambda.sin();
            cos_lambda = lambda.cos();

            sin_sigma = ((cos_u2 * sin_lambda).powi(2)
                + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
            .sqrt();
            if sin_sigma == 0.0 {
                // Coincident points
                return (None, 0.0);
            }
            cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
            sigma = sin_sigma.atan2(cos_sigma);
            let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
            cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
            cos_2sigma_m = if cos_sq_alpha == 0.0 {
                // Equatorial line
                0.0
            } else {
                cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
            };
            let c = FLATTENING / 16.0 * cos_sq_alpha * (4.0 + FLATTENING * (4.0 - 3.0 * cos_sq_alpha));
            let prev = lambda;
            lambda = l
                + (1.0 - c)
                    * FLATTENING
                    * sin_alpha
                    * (sigma
                        + c * sin_sigma
                            * (cos_2sigma_m
                                + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));
            if (lambda - prev).abs() < CONVERGENCE {
                converged = true;
                break;
            }
        }

        let u_sq = cos_sq_alpha
            * (SEMI_MAJOR_NM * SEMI_MAJOR_NM - SEMI_MINOR_NM * SEMI_MINOR_NM)
            / (SEMI_MINOR_NM * SEMI_MINOR_NM);
        let a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
        let b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
        let delta_sigma = b
            * sin_sigma
            * (cos_2sigma_m
                + b / 4.0
                    * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                        - b / 6.0
                            * cos_2sigma_m
                            * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                            * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
        let distance = SEMI_MINOR_NM * a * (sigma - delta_sigma);

        if !converged {
            return (None, distance);
        }

        let bearing = (cos_u2 * sin_lambda)
            .atan2(cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda)
            .to_degrees();
        (Some(normalize_heading(bearing)), distance)
    }
}

impl Add for Coordinate {
    type Output = Coordinate;

    fn add(self, rhs: Coordinate) -> Coordinate {
        Coordinate {
            latitude: (self.latitude + rhs.latitude).clamp(-90.0, 90.0),
            longitude: (self.longitude + rhs.longitude).clamp(-180.0, 180.0),
        }
    }
}

impl Sub for Coordinate {
    type Output = Coordinate;

    fn sub(self, rhs: Coordinate) -> Coordinate {
        Coordinate {
            latitude: (self.latitude - rhs.latitude).clamp(-90.0, 90.0),
            longitude: (self.longitude - rhs.longitude).clamp(-180.0, 180.0),
        }
    }
}

/// Normalise a heading in degrees into `[0, 360)`.
pub fn normalize_heading(heading: f64) -> f64 {
    let h = heading.rem_euclid(360.0);
    // rem_euclid(-1e-18, 360.0) rounds to 360.0 itself
    if h >= 360.0 { 0.0 } else { h }
}

/// Signed difference `to - from` folded into `[-180, 180)`. Positive
/// means the shorter turn is clockwise; an exact reversal comes out
/// negative.
pub fn heading_delta(from: f64, to: f64) -> f64 {
    (to - from + 180.0).rem_euclid(360.0) - 180.0
}

//! Joint angle from three 2D landmarks.

/// Angle at vertex `b` between rays `b→a` and `b→c`, in degrees (0..=180)
///
/// Returns 0.0 when either ray has zero length, which happens when an
/// occluded landmark collapses onto the vertex.
pub fn compute_angle(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    let (bax, bay) = (a.0 - b.0, a.1 - b.1);
    let (bcx, bcy) = (c.0 - b.0, c.1 - b.1);

    let mag_ba = bax.hypot(bay);
    let mag_bc = bcx.hypot(bcy);
    if mag_ba == 0.0 || mag_bc == 0.0 {
        return 0.0;
    }

    // Rounding can push the cosine just outside [-1, 1]
    let cos = ((bax * bcx + bay * bcy) / (mag_ba * mag_bc)).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

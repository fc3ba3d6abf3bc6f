//! Colour helpers: hue wheel, brightness scaling, duty clamping.

/// Colour as `(r, g, b)`, each channel a PWM duty in `0..=255`.
pub type Rgb = (u8, u8, u8);

pub const OFF: Rgb = (0, 0, 0);
pub const RED: Rgb = (255, 0, 0);
pub const GREEN: Rgb = (0, 255, 0);
pub const BLUE: Rgb = (0, 0, 255);
pub const CYAN: Rgb = (0, 255, 255);
pub const AMBER: Rgb = (255, 100, 0);
pub const YELLOW: Rgb = (255, 200, 0);
pub const BT_BLUE: Rgb = (0, 100, 255);
pub const DIM_GREEN: Rgb = (0, 150, 0);

/// Convert a float to a duty, clamping to `0..=255` and truncating like the
/// integer conversions the animations were tuned with.
pub fn clamp_duty(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 255.0) as u8
}

/// Fully saturated, full value colour at `hue` turns. Any real `hue` is
/// accepted; it wraps onto `[0, 1)`.
pub fn hue_to_rgb(hue: f32) -> Rgb {
    let h = hue.rem_euclid(1.0) * 6.0;
    let sector = h.floor();
    let f = h - sector;
    let q = 1.0 - f;
    let (r, g, b) = match (sector as u8) % 6 {
        0 => (1.0, f, 0.0),
        1 => (q, 1.0, 0.0),
        2 => (0.0, 1.0, f),
        3 => (0.0, q, 1.0),
        4 => (f, 0.0, 1.0),
        _ => (1.0, 0.0, q),
    };
    (
        clamp_duty(r * 255.0),
        clamp_duty(g * 255.0),
        clamp_duty(b * 255.0),
    )
}

/// Scale every channel by `brightness` in `[0, 1]`.
pub fn scale(colour: Rgb, brightness: f32) -> Rgb {
    let k = brightness.clamp(0.0, 1.0);
    (
        clamp_duty(colour.0 as f32 * k),
        clamp_duty(colour.1 as f32 * k),
        clamp_duty(colour.2 as f32 * k),
    )
}

/// Linear interpolation between two colours, `t` in `[0, 1]`.
pub fn lerp(from: Rgb, to: Rgb, t: f32) -> Rgb {
    let t = t.clamp(0.0, 1.0);
    let mix = |a: u8, b: u8| clamp_duty(a as f32 + (b as f32 - a as f32) * t);
    (mix(from.0, to.0), mix(from.1, to.1), mix(from.2, to.2))
}

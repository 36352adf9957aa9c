use serde::Serialize;

use crate::backend::Emulator;

/// Memory layout for the US ROM. Two runtime pointers are read first; every
/// other field is a fixed offset from one of them. The layout is specific
/// to one game build and must match exactly.
pub mod mem {
    /// Points at the player's kart physics block.
    pub const ADDR_BASE_POINTER: u32 = 0x0217_ACF8;
    /// Points at the per-racer progress block (laps, checkpoints).
    pub const ADDR_RACE_INFO_POINTER: u32 = 0x0217_55FC;
    /// Points at the race clock block.
    pub const ADDR_TIMER_POINTER: u32 = 0x0217_AA34;

    // Offsets from the base-state pointer.
    pub const OFFSET_SPEED: u32 = 0x2A8;
    pub const OFFSET_ANGLE: u32 = 0x236;
    pub const OFFSET_OFFROAD: u32 = 0xDC;
    pub const OFFSET_POS_X: u32 = 0x80;

    // Offsets from the race-info pointer.
    pub const OFFSET_LAP: u32 = 0x38;
    pub const OFFSET_CHECKPOINT: u32 = 0x46;

    // Offset from the timer pointer.
    pub const OFFSET_RACE_TIMER: u32 = 0x4;

    /// The game stores physical quantities as 20.12 fixed-point.
    pub const FIXED_POINT_SCALE: f64 = 4096.0;
}

/// Decode a raw 20.12 fixed-point value.
pub fn fixed_to_float(raw: i32) -> f64 {
    raw as f64 / mem::FIXED_POINT_SCALE
}

/// Race state decoded from emulator memory for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawTelemetry {
    /// Forward speed, game units per tick.
    pub speed: f64,
    /// Facing angle, signed 16-bit, not scaled.
    pub angle: i16,
    /// Course-local progress marker, resets each lap.
    pub checkpoint: u8,
    pub lap: u8,
    /// Traction multiplier; 1.0 is full traction, below 0.9 is offroad.
    pub offroad: f64,
    /// Kart position, decoded fixed-point components.
    pub position: [f64; 3],
    /// Internal race clock, ticks. Monotonic while racing, not wall-clock.
    pub race_timer: u32,
}

impl RawTelemetry {
    /// The defined pre-race state: returned whenever either runtime pointer
    /// is still null. Not an error condition.
    pub fn sentinel() -> Self {
        Self {
            speed: 0.0,
            angle: 0,
            checkpoint: 0,
            lap: 0,
            offroad: 1.0,
            position: [0.0; 3],
            race_timer: 0,
        }
    }
}

impl Default for RawTelemetry {
    fn default() -> Self {
        Self::sentinel()
    }
}

/// Read the full telemetry set in a fixed number of memory reads. Pointers
/// are read before they are dereferenced; a zero pointer short-circuits to
/// the sentinel rather than reading through it.
pub fn read_telemetry<B: Emulator + ?Sized>(backend: &B) -> RawTelemetry {
    let base = backend.read_u32(mem::ADDR_BASE_POINTER);
    let race_info = backend.read_u32(mem::ADDR_RACE_INFO_POINTER);
    if base == 0 || race_info == 0 {
        return RawTelemetry::sentinel();
    }

    let timer_base = backend.read_u32(mem::ADDR_TIMER_POINTER);
    let race_timer = if timer_base == 0 {
        0
    } else {
        backend.read_u32(timer_base + mem::OFFSET_RACE_TIMER)
    };

    RawTelemetry {
        speed: fixed_to_float(backend.read_i32(base + mem::OFFSET_SPEED)),
        angle: backend.read_i16(base + mem::OFFSET_ANGLE),
        checkpoint: backend.peek(race_info + mem::OFFSET_CHECKPOINT),
        lap: backend.peek(race_info + mem::OFFSET_LAP),
        offroad: fixed_to_float(backend.read_i32(base + mem::OFFSET_OFFROAD)),
        position: [
            fixed_to_float(backend.read_i32(base + mem::OFFSET_POS_X)),
            fixed_to_float(backend.read_i32(base + mem::OFFSET_POS_X + 4)),
            fixed_to_float(backend.read_i32(base + mem::OFFSET_POS_X + 8)),
        ],
        race_timer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptFrame, ScriptedBackend};

    #[test]
    fn fixed_point_decode_is_exact() {
        assert_eq!(fixed_to_float(0), 0.0);
        assert_eq!(fixed_to_float(4096), 1.0);
        assert_eq!(fixed_to_float(-4096), -1.0);
        assert_eq!(fixed_to_float(2048), 0.5);
        assert_eq!(fixed_to_float(40960), 10.0);
        assert_eq!(fixed_to_float(-6144), -1.5);
        assert_eq!(fixed_to_float(1), 1.0 / 4096.0);
    }

    #[test]
    fn decodes_a_full_frame() {
        let backend = ScriptedBackend::new(vec![ScriptFrame {
            speed_raw: 40960,
            angle: -8233,
            checkpoint: 7,
            lap: 2,
            offroad_raw: 2048,
            pos_raw: [4096, -4096, 8192],
            race_timer: 1234,
            ..Default::default()
        }]);
        let t = read_telemetry(&backend);
        assert_eq!(t.speed, 10.0);
        assert_eq!(t.angle, -8233);
        assert_eq!(t.checkpoint, 7);
        assert_eq!(t.lap, 2);
        assert_eq!(t.offroad, 0.5);
        assert_eq!(t.position, [1.0, -1.0, 2.0]);
        assert_eq!(t.race_timer, 1234);
    }

    #[test]
    fn null_pointers_yield_sentinel_regardless_of_memory() {
        let backend = ScriptedBackend::new(vec![ScriptFrame {
            in_race: false,
            speed_raw: 40960,
            checkpoint: 9,
            lap: 2,
            offroad_raw: 0,
            pos_raw: [123, 456, 789],
            race_timer: 42,
            ..Default::default()
        }]);
        assert_eq!(read_telemetry(&backend), RawTelemetry::sentinel());
    }

    #[test]
    fn sentinel_is_full_traction_at_origin() {
        let s = RawTelemetry::sentinel();
        assert_eq!(s.speed, 0.0);
        assert_eq!(s.offroad, 1.0);
        assert_eq!(s.position, [0.0, 0.0, 0.0]);
        assert_eq!(s.checkpoint, 0);
        assert_eq!(s.lap, 0);
    }
}

use anyhow::Result;
use bitflags::bitflags;

use crate::telemetry::mem;
use crate::{SCREEN_HEIGHT_BOTH, SCREEN_WIDTH};

bitflags! {
    /// DS button mask asserted on the emulated keypad each step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const A = 1 << 0;
        const B = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const R = 1 << 4;
        const L = 1 << 5;
        const START = 1 << 6;
    }
}

/// The three capabilities the environment needs from a simulation backend:
/// read raw memory, read the framebuffer, and drive the keypad. Any
/// compliant backend can stand in for the real emulator, which is how the
/// tests run without a ROM.
///
/// The framebuffer is RGBX, `SCREEN_WIDTH x SCREEN_HEIGHT_BOTH` (both DS
/// screens stacked vertically), 4 bytes per pixel.
pub trait Emulator {
    /// Read one byte of emulated memory.
    fn peek(&self, addr: u32) -> u8;

    /// Replace the currently held button set. Buttons not present in
    /// `buttons` are released.
    fn set_buttons(&mut self, buttons: Buttons);

    /// Advance the simulation by one tick. A hard failure here means the
    /// simulation is gone and the episode cannot continue.
    fn tick(&mut self) -> Result<()>;

    /// Raw RGBX framebuffer for the most recent tick.
    fn frame_buffer(&self) -> &[u8];

    /// Rewind to the fixed pre-race snapshot. Returns `Ok(false)` when no
    /// snapshot is available, in which case the caller continues from the
    /// current simulation state.
    fn load_snapshot(&mut self) -> Result<bool>;

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.peek(addr), self.peek(addr + 1)])
    }

    fn read_i16(&self, addr: u32) -> i16 {
        self.read_u16(addr) as i16
    }

    fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.peek(addr),
            self.peek(addr + 1),
            self.peek(addr + 2),
            self.peek(addr + 3),
        ])
    }

    fn read_i32(&self, addr: u32) -> i32 {
        self.read_u32(addr) as i32
    }
}

// =============================================================================
// Scripted backend
// =============================================================================

/// One tick of canned race state served by [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct ScriptFrame {
    /// Whether the race pointers are populated. Pre-race frames report
    /// zero pointers and the decoder falls back to sentinel telemetry.
    pub in_race: bool,
    /// Forward speed, raw fixed-point (1/4096).
    pub speed_raw: i32,
    /// Facing angle, signed 16-bit.
    pub angle: i16,
    pub checkpoint: u8,
    pub lap: u8,
    /// Traction multiplier, raw fixed-point (4096 = full traction).
    pub offroad_raw: i32,
    /// Kart position, raw fixed-point components.
    pub pos_raw: [i32; 3],
    /// Internal race timer, ticks.
    pub race_timer: u32,
    /// Fill shade for the synthesized top screen.
    pub shade: u8,
}

impl Default for ScriptFrame {
    fn default() -> Self {
        Self {
            in_race: true,
            speed_raw: 0,
            angle: 0,
            checkpoint: 0,
            lap: 0,
            offroad_raw: mem::FIXED_POINT_SCALE as i32,
            pos_raw: [0; 3],
            race_timer: 0,
            shade: 0x60,
        }
    }
}

// Where the scripted backend pretends the game allocated its state.
const SCRIPT_BASE_STATE: u32 = 0x020F_4000;
const SCRIPT_RACE_INFO: u32 = 0x0210_8000;
const SCRIPT_TIMER_BASE: u32 = 0x0211_2000;

/// Replays a canned telemetry script through the [`Emulator`] interface,
/// synthesizing memory reads against the real MKDS memory layout and an
/// RGBX framebuffer for the observation path. One `tick` advances one
/// script frame; the script saturates at its last frame.
pub struct ScriptedBackend {
    frames: Vec<ScriptFrame>,
    cursor: usize,
    has_snapshot: bool,
    held: Buttons,
    fb: Vec<u8>,
}

impl ScriptedBackend {
    pub fn new(frames: Vec<ScriptFrame>) -> Self {
        assert!(!frames.is_empty(), "scripted backend needs at least one frame");
        let mut backend = Self {
            frames,
            cursor: 0,
            has_snapshot: true,
            held: Buttons::empty(),
            fb: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT_BOTH * 4],
        };
        backend.render();
        backend
    }

    /// Same script, but `load_snapshot` reports no snapshot available, for
    /// exercising the degraded reset path.
    pub fn without_snapshot(mut self) -> Self {
        self.has_snapshot = false;
        self
    }

    /// A plausible race: the kart accelerates to cruising speed, advances a
    /// checkpoint every `ticks_per_checkpoint` ticks, wraps into a new lap
    /// every `checkpoints_per_lap` checkpoints, and clips a patch of grass
    /// midway through each lap.
    pub fn synthetic_race(
        ticks: usize,
        ticks_per_checkpoint: u32,
        checkpoints_per_lap: u8,
    ) -> Self {
        let scale = mem::FIXED_POINT_SCALE as i32;
        let mut frames = Vec::with_capacity(ticks);
        for t in 0..ticks as u32 {
            let speed = (t.min(60) as i32) * scale / 12; // ramps to 5.0
            let total_cp = t / ticks_per_checkpoint;
            let lap = (total_cp / checkpoints_per_lap as u32) as u8;
            let checkpoint = (total_cp % checkpoints_per_lap as u32) as u8;
            let offroad = if checkpoint == checkpoints_per_lap / 2 {
                scale / 2
            } else {
                scale
            };
            frames.push(ScriptFrame {
                in_race: true,
                speed_raw: speed,
                angle: ((t as i32 * 180) % 65536 - 32768) as i16,
                checkpoint,
                lap,
                offroad_raw: offroad,
                pos_raw: [(t as i32) * scale, 0, (t as i32) * scale / 2],
                race_timer: t,
                shade: 0x40 + (t % 0x80) as u8,
            });
        }
        Self::new(frames)
    }

    pub fn frame(&self) -> &ScriptFrame {
        &self.frames[self.cursor]
    }

    /// Buttons currently asserted, for verifying the input contract.
    pub fn held(&self) -> Buttons {
        self.held
    }

    pub fn exhausted(&self) -> bool {
        self.cursor + 1 >= self.frames.len()
    }

    fn render(&mut self) {
        let frame = &self.frames[self.cursor];
        let shade = frame.shade;
        for y in 0..SCREEN_HEIGHT_BOTH {
            // Bottom screen stays dark so tests can verify the crop.
            let base = if y < SCREEN_HEIGHT_BOTH / 2 { shade } else { 0x10 };
            for x in 0..SCREEN_WIDTH {
                let px = (y * SCREEN_WIDTH + x) * 4;
                let v = base.wrapping_add((x as u8) >> 4);
                self.fb[px] = v;
                self.fb[px + 1] = v;
                self.fb[px + 2] = v;
                self.fb[px + 3] = 0xFF;
            }
        }
    }

    fn field_byte(&self, addr: u32) -> u8 {
        let frame = &self.frames[self.cursor];
        let le32 = |v: u32, base: u32| (v >> ((addr - base) * 8)) as u8;

        // Runtime pointers. A pre-race frame reports them as zero.
        if (mem::ADDR_BASE_POINTER..mem::ADDR_BASE_POINTER + 4).contains(&addr) {
            return if frame.in_race {
                le32(SCRIPT_BASE_STATE, mem::ADDR_BASE_POINTER)
            } else {
                0
            };
        }
        if (mem::ADDR_RACE_INFO_POINTER..mem::ADDR_RACE_INFO_POINTER + 4).contains(&addr) {
            return if frame.in_race {
                le32(SCRIPT_RACE_INFO, mem::ADDR_RACE_INFO_POINTER)
            } else {
                0
            };
        }
        if (mem::ADDR_TIMER_POINTER..mem::ADDR_TIMER_POINTER + 4).contains(&addr) {
            return if frame.in_race {
                le32(SCRIPT_TIMER_BASE, mem::ADDR_TIMER_POINTER)
            } else {
                0
            };
        }

        // Base-state block.
        let base = SCRIPT_BASE_STATE;
        if (base + mem::OFFSET_SPEED..base + mem::OFFSET_SPEED + 4).contains(&addr) {
            return le32(frame.speed_raw as u32, base + mem::OFFSET_SPEED);
        }
        if (base + mem::OFFSET_ANGLE..base + mem::OFFSET_ANGLE + 2).contains(&addr) {
            return (frame.angle as u16 >> ((addr - (base + mem::OFFSET_ANGLE)) * 8)) as u8;
        }
        if (base + mem::OFFSET_OFFROAD..base + mem::OFFSET_OFFROAD + 4).contains(&addr) {
            return le32(frame.offroad_raw as u32, base + mem::OFFSET_OFFROAD);
        }
        for (i, component) in frame.pos_raw.iter().enumerate() {
            let start = base + mem::OFFSET_POS_X + (i as u32) * 4;
            if (start..start + 4).contains(&addr) {
                return le32(*component as u32, start);
            }
        }

        // Race-info block.
        if addr == SCRIPT_RACE_INFO + mem::OFFSET_CHECKPOINT {
            return frame.checkpoint;
        }
        if addr == SCRIPT_RACE_INFO + mem::OFFSET_LAP {
            return frame.lap;
        }

        // Race timer block.
        let timer = SCRIPT_TIMER_BASE + mem::OFFSET_RACE_TIMER;
        if (timer..timer + 4).contains(&addr) {
            return le32(frame.race_timer, timer);
        }

        0
    }
}

impl Emulator for ScriptedBackend {
    fn peek(&self, addr: u32) -> u8 {
        self.field_byte(addr)
    }

    fn set_buttons(&mut self, buttons: Buttons) {
        self.held = buttons;
    }

    fn tick(&mut self) -> Result<()> {
        if self.cursor + 1 < self.frames.len() {
            self.cursor += 1;
            self.render();
        }
        Ok(())
    }

    fn frame_buffer(&self) -> &[u8] {
        &self.fb
    }

    fn load_snapshot(&mut self) -> Result<bool> {
        if !self.has_snapshot {
            return Ok(false);
        }
        self.cursor = 0;
        self.held = Buttons::empty();
        self.render();
        Ok(true)
    }
}

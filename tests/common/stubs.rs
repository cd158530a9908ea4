//! Host game stand-ins for integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use rollback_netplay::{
    buttons, HostBindings, InputSample, MemoryAccessor, MenuConfirmState, NetplayError, Player,
    SelectorMode, TrainingResetAction,
};

/// Bytes of game memory the lockstep stub simulates: a `u32` clock at 0 and a
/// `u32` accumulator at 4.
pub const GAME_MEMORY_SIZE: usize = 8;

/// Host bindings backed by plain fields the test pokes directly.
#[derive(Debug, Default, Clone)]
pub struct HostStub {
    pub time: u32,
    pub menu_index: u8,
    pub confirm: MenuConfirmState,
    pub paused: bool,
    pub selector: SelectorMode,
    pub raw: [InputSample; 2],
    pub resets: Vec<(Player, TrainingResetAction)>,
}

impl HostBindings for HostStub {
    fn world_time(&self) -> u32 {
        self.time
    }

    fn current_menu_index(&self) -> u8 {
        self.menu_index
    }

    fn menu_confirm_state(&self) -> MenuConfirmState {
        self.confirm
    }

    fn set_menu_confirm_state(&mut self, state: MenuConfirmState) {
        self.confirm = state;
    }

    fn raw_input(&self, player: Player) -> InputSample {
        self.raw[player.slot()]
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn selector_mode(&self, _player: Player) -> SelectorMode {
        self.selector
    }

    fn apply_training_reset(&mut self, player: Player, action: TrainingResetAction) {
        self.resets.push((player, action));
    }
}

/// Flat little-endian memory with 64-bit pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VecMemory(pub Vec<u8>);

impl VecMemory {
    pub fn new(size: usize) -> Self {
        Self(vec![0; size])
    }

    pub fn u32_at(&self, address: usize) -> u32 {
        u32::from_le_bytes(self.0[address..address + 4].try_into().unwrap())
    }

    pub fn set_u32(&mut self, address: usize, value: u32) {
        self.0[address..address + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_pointer(&mut self, address: usize, target: usize) {
        self.0[address..address + 8].copy_from_slice(&(target as u64).to_le_bytes());
    }
}

impl MemoryAccessor for VecMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), NetplayError> {
        let src = self
            .0
            .get(address..address + buf.len())
            .ok_or(NetplayError::MemoryAccess {
                address,
                len: buf.len(),
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError> {
        let dst = self
            .0
            .get_mut(address..address + bytes.len())
            .ok_or(NetplayError::MemoryAccess {
                address,
                len: bytes.len(),
            })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn read_pointer(&self, address: usize) -> Result<usize, NetplayError> {
        let mut raw = [0; 8];
        self.read(address, &mut raw)?;
        Ok(u64::from_le_bytes(raw) as usize)
    }
}

/// A deterministic controller script: the direction cycles every few frames
/// and each player taps a different attack button on its own rhythm.
///
/// Never presses START or the training reset buttons.
pub fn scripted_input(player: Player, frame: u32) -> InputSample {
    const DIRECTIONS: [u16; 4] = [buttons::NEUTRAL, buttons::LEFT, buttons::RIGHT, buttons::DOWN];
    let offset = player.slot() as u32 * 3;
    let direction = DIRECTIONS[((frame + offset) / 6 % 4) as usize];
    let attack = match player {
        Player::One => buttons::A,
        Player::Two => buttons::C,
    };
    let pressed = (frame / 4 + offset) % 3 == 0;
    InputSample::combine(direction, if pressed { attack } else { 0 })
}

//! Direction and button bits of an [`InputSample`](crate::InputSample).
//!
//! Directions use numpad notation in the low nibble. Button values are the
//! unshifted bits; [`InputSample::combine`](crate::InputSample::combine) moves
//! them into place.

/// No direction held.
pub const NEUTRAL: u16 = 0;
/// Numpad 8.
pub const UP: u16 = 8;
/// Numpad 2.
pub const DOWN: u16 = 2;
/// Numpad 4.
pub const LEFT: u16 = 4;
/// Numpad 6.
pub const RIGHT: u16 = 6;

/// Pause / start.
pub const START: u16 = 0x001;
/// D button.
pub const D: u16 = 0x004;
/// C button.
pub const C: u16 = 0x008;
/// A button (also menu select).
pub const A: u16 = 0x010;
/// B button (also menu back).
pub const B: u16 = 0x020;
/// A+B macro.
pub const AB: u16 = 0x040;
/// E button.
pub const E: u16 = 0x080;
/// Function button 1.
pub const FN1: u16 = 0x100;
/// Function button 2, used for training position reset.
pub const FN2: u16 = 0x200;
/// Menu confirm.
pub const CONFIRM: u16 = 0x400;
/// Menu cancel.
pub const CANCEL: u16 = 0x800;

/// Everything that selects a menu entry.
pub const ANY_CONFIRM: u16 = A | CONFIRM;
/// Everything that backs out of a menu.
pub const ANY_CANCEL: u16 = B | CANCEL;

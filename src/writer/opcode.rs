/// `INT imm8`; with `INT_OVERLAY_MANAGER` it traps into the overlay manager.
pub const OP_INT: u8 = 0xcd;
pub const INT_OVERLAY_MANAGER: u8 = 0x3f;
/// `CALL ptr16:16`
pub const OP_CALL_FAR: u8 = 0x9a;

/// `INT 3Fh`, overlay id (u8), target offset (u16 LE).
pub const TRAP_PATTERN: [u8; 2] = [OP_INT, INT_OVERLAY_MANAGER];
pub const TRAP_LEN: usize = 5;

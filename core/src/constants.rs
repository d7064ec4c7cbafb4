//! Constants module - capacities, lag window and wire protocol constants

// =============================================================================
// Object pools
// =============================================================================

/// Maximum number of characters alive at once
pub const MAX_CHR: usize = 512;
/// Maximum number of particles alive at once
pub const MAX_PRT: usize = 512;

/// Maximum number of players in one session (local and remote combined)
pub const MAX_PLAYER: usize = 8;

// =============================================================================
// Latch buffer
// =============================================================================

/// Number of frames of latch history kept per entity. Must be a power of two.
pub const MAXLAG: usize = 64;
/// Mask turning a timestamp into a lag frame index
pub const LAGAND: u32 = (MAXLAG as u32) - 1;

/// Fixed-point scale of the motion deltas on the wire
pub const SHORTLATCH: f32 = 1024.0;

/// Frames a remote waits after the module starts before it talks to the host
pub const STARTTALK: u32 = 10;

const _: () = assert!(MAXLAG.is_power_of_two());

// =============================================================================
// Network
// =============================================================================

/// Default TCP port of the host
pub const NETWORK_PORT: u16 = 34626;

/// Longest string (without the terminating null) carried in a packet
pub const MAX_PACKET_STRING: usize = 255;

/// Largest message body the transports will frame
pub const MAX_PACKET_SIZE: usize = 4096;

/// Bytes of file data carried by one `NET_TRANSFER_FILE` message
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Size of one `{handle, button, x, y}` entry of a latch packet
pub const LATCH_ENTRY_SIZE: usize = 2 + 1 + 2 + 2;

// =============================================================================
// World
// =============================================================================

/// Ticks per second of the simulation
pub const TICKS: u32 = 50;

/// Distance a character moves per tick at full stick deflection
pub const WALK_SPEED: f32 = 4.0;

/// Upward velocity given by the jump button
pub const JUMP_VELOCITY: f32 = 8.0;

/// Downward acceleration per tick
pub const GRAVITY: f32 = 1.0;

/// Frames a jump dust particle lives
pub const DUST_LIFETIME: u16 = 12;

//! NBD protocol constants (fixed newstyle negotiation + the command subset
//! the source backup client needs). Values as defined by the NBD protocol
//! specification; not tunable, so plain `const`s rather than config.

pub const NBDMAGIC_IHAVEOPT: u64 = 0x4948_4156_454F_5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003_e889_0455_65a9;

pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_SET_META_CONTEXT: u32 = 8;

pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_META_CONTEXT: u32 = 4;

pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;
pub const NBD_CMD_BLOCK_STATUS: u16 = 7;

/// `base:allocation` status bit: set means "hole" (unallocated).
pub const NBD_STATE_HOLE: u32 = 1 << 0;

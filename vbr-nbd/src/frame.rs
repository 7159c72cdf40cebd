//! Fixed-size on-wire frames, mirroring `pbs-datastore::file_formats`'s
//! `#[repr(C, packed)]` + `derive(Endian)` header idiom.

use endian_trait::Endian;

#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
pub struct RequestHeader {
    pub magic: u32,
    pub flags: u16,
    pub cmd_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
pub struct SimpleReplyHeader {
    pub magic: u32,
    pub error: u32,
    pub handle: u64,
}

#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
pub struct StructuredReplyHeader {
    pub magic: u32,
    pub flags: u16,
    pub reply_type: u16,
    pub handle: u64,
    pub length: u32,
}

/// One run of allocated-or-hole space, as reported by `BLOCK_STATUS`
/// against the `base:allocation` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u32,
    pub is_hole: bool,
}

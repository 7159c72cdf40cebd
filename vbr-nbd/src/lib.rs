//! Minimal NBD client wire codec (§4.4a): newstyle handshake with
//! `NBD_OPT_GO`/`base:allocation`, and the four commands the source
//! backup client needs -- `READ`, `WRITE`, `WRITE_ZEROES`, `BLOCK_STATUS`.
//!
//! Fixed-size frames are `#[repr(C, packed)]` structs deriving `Endian`,
//! mirroring `pbs-datastore::file_formats::DataBlobHeader` and read/written
//! with `proxmox_io::{ReadExt, WriteExt}` in the network-byte-order
//! (`_be_value`) form NBD requires. Variable length sections (export names,
//! option payloads) are framed by hand, since they don't fit a fixed
//! `#[repr(C)]` struct.

pub mod consts;
mod frame;

use std::io::Cursor;

use anyhow::{bail, Context as _, Error};
use log::debug;
use proxmox_io::{ReadExt, WriteExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub use frame::{Extent, RequestHeader, SimpleReplyHeader, StructuredReplyHeader};

use consts::*;

/// One negotiated NBD export, ready for READ/WRITE/BLOCK_STATUS traffic.
pub struct NbdClient {
    stream: TcpStream,
    pub export_size: u64,
    pub supports_base_allocation: bool,
    next_handle: u64,
}

impl NbdClient {
    /// Connect to `addr` (the local end of an SSH-forwarded port, see
    /// `vbr-tunnel`) and negotiate `export_name` with `base:allocation`
    /// metadata context support.
    pub async fn connect(addr: &str, export_name: &str) -> Result<Self, Error> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to NBD server at {addr}"))?;

        let mut magic = [0u8; 8];
        stream.read_exact(&mut magic).await?;
        if &magic != b"NBDMAGIC" {
            bail!("not an NBD server: bad initial magic from {addr}");
        }

        let mut opts_magic = [0u8; 8];
        stream.read_exact(&mut opts_magic).await?;
        if u64::from_be_bytes(opts_magic) != NBDMAGIC_IHAVEOPT {
            bail!("server at {addr} does not support the newstyle protocol");
        }

        let handshake_flags = stream.read_u16().await?;
        if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            bail!("server at {addr} does not advertise NBD_FLAG_FIXED_NEWSTYLE");
        }

        // client flags: always request fixed newstyle; skip the legacy
        // zero-padding the server would otherwise send (NBD_FLAG_NO_ZEROES).
        stream
            .write_u32(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES)
            .await?;

        let (export_size, supports_base_allocation) = Self::negotiate_go(&mut stream, export_name).await?;

        debug!(
            "nbd client: negotiated export '{export_name}' on {addr}, size={export_size}, base:allocation={supports_base_allocation}"
        );

        Ok(Self {
            stream,
            export_size,
            supports_base_allocation,
            next_handle: 1,
        })
    }

    async fn negotiate_go(stream: &mut TcpStream, export_name: &str) -> Result<(u64, bool), Error> {
        let context = b"base:allocation";
        let name_bytes = export_name.as_bytes();

        // NBD_OPT_GO payload: u32 name len, name, u16 nr_info_requests, the
        // requests themselves (NBD_INFO_BLOCK_SIZE), u32 nr_contexts,
        // (u32 len + bytes) per requested metadata context.
        let mut payload = Vec::new();
        payload.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
        payload.extend_from_slice(name_bytes);
        payload.extend_from_slice(&1u16.to_be_bytes()); // one info request
        payload.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());

        stream.write_all(&NBDMAGIC_IHAVEOPT.to_be_bytes()).await?;
        stream.write_u32(NBD_OPT_GO).await?;
        stream.write_u32(payload.len() as u32).await?;
        stream.write_all(&payload).await?;

        // separately negotiate the base:allocation metadata context so
        // BLOCK_STATUS replies carry sparseness information (§4.4 step c).
        let mut set_meta_payload = Vec::new();
        set_meta_payload.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
        set_meta_payload.extend_from_slice(name_bytes);
        set_meta_payload.extend_from_slice(&1u32.to_be_bytes()); // one context query
        set_meta_payload.extend_from_slice(&(context.len() as u32).to_be_bytes());
        set_meta_payload.extend_from_slice(context);

        stream.write_all(&NBDMAGIC_IHAVEOPT.to_be_bytes()).await?;
        stream.write_u32(NBD_OPT_SET_META_CONTEXT).await?;
        stream.write_u32(set_meta_payload.len() as u32).await?;
        stream.write_all(&set_meta_payload).await?;

        let mut export_size = 0u64;
        let mut supports_base_allocation = false;
        let mut go_acked = false;
        let mut meta_context_acked = false;

        // keep reading option replies until both NBD_OPT_SET_META_CONTEXT
        // and NBD_OPT_GO have acked (or one errors); replies for the two
        // options interleave in server-chosen order.
        while !go_acked || !meta_context_acked {
            let reply_magic = stream.read_u64().await?;
            if reply_magic != NBD_REP_MAGIC {
                bail!("bad option reply magic from server");
            }
            let option = stream.read_u32().await?;
            let reply_type = stream.read_u32().await?;
            let len = stream.read_u32().await?;
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).await?;

            if reply_type & NBD_REP_FLAG_ERROR != 0 {
                if option == NBD_OPT_SET_META_CONTEXT {
                    // server may simply not support base:allocation; proceed
                    // without block-status support rather than failing the
                    // whole connection.
                    meta_context_acked = true;
                    continue;
                }
                bail!("server rejected option {option} with error reply type {reply_type:#x}");
            }

            match (option, reply_type) {
                (NBD_OPT_GO, NBD_REP_INFO) if data.len() >= 2 => {
                    let info_type = u16::from_be_bytes([data[0], data[1]]);
                    if info_type == NBD_INFO_EXPORT && data.len() >= 12 {
                        export_size = u64::from_be_bytes(data[2..10].try_into().unwrap());
                    }
                }
                (NBD_OPT_GO, NBD_REP_ACK) => {
                    go_acked = true;
                }
                (NBD_OPT_SET_META_CONTEXT, NBD_REP_META_CONTEXT) => {
                    supports_base_allocation = true;
                }
                (NBD_OPT_SET_META_CONTEXT, NBD_REP_ACK) => {
                    meta_context_acked = true;
                }
                _ => {}
            }
        }

        Ok((export_size, supports_base_allocation))
    }

    fn take_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    async fn send_request(&mut self, cmd_type: u16, offset: u64, length: u32, handle: u64) -> Result<(), Error> {
        let header = RequestHeader {
            magic: NBD_REQUEST_MAGIC,
            flags: 0,
            cmd_type,
            handle,
            offset,
            length,
        };
        let mut buf = Vec::with_capacity(std::mem::size_of::<RequestHeader>());
        (&mut buf).write_be_value(header)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn read_simple_reply(&mut self, expect_handle: u64) -> Result<SimpleReplyHeader, Error> {
        let mut buf = vec![0u8; std::mem::size_of::<SimpleReplyHeader>()];
        self.stream.read_exact(&mut buf).await?;
        let header: SimpleReplyHeader = Cursor::new(buf).read_be_value()?;
        if header.magic != NBD_SIMPLE_REPLY_MAGIC {
            bail!("unexpected NBD reply magic {:#x}", header.magic);
        }
        if header.handle != expect_handle {
            bail!(
                "NBD reply handle mismatch: expected {expect_handle}, got {}",
                header.handle
            );
        }
        if header.error != 0 {
            bail!("NBD server returned error code {}", header.error);
        }
        Ok(header)
    }

    /// `NBD_CMD_READ`: read `length` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        let handle = self.take_handle();
        self.send_request(NBD_CMD_READ, offset, length, handle).await?;
        self.read_simple_reply(handle).await?;
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).await?;
        Ok(data)
    }

    /// `NBD_CMD_WRITE`: write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let handle = self.take_handle();
        self.send_request(NBD_CMD_WRITE, offset, data.len() as u32, handle)
            .await?;
        self.stream.write_all(data).await?;
        self.read_simple_reply(handle).await?;
        Ok(())
    }

    /// `NBD_CMD_WRITE_ZEROES`: punch `length` zero bytes at `offset`
    /// without transferring them on the wire -- the client-side sparse
    /// detection path (§4.4) routes here instead of `write`.
    pub async fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<(), Error> {
        let handle = self.take_handle();
        self.send_request(NBD_CMD_WRITE_ZEROES, offset, length, handle)
            .await?;
        self.read_simple_reply(handle).await?;
        Ok(())
    }

    /// `NBD_CMD_BLOCK_STATUS` against the `base:allocation` context: returns
    /// the target export's allocated/hole extent list. Client-side sparse
    /// detection (§4.4) reads from the hypervisor and checks for all-zero
    /// buffers instead, since the source -- not the qemu-nbd target -- is
    /// the one with a CBT-driven extent list to work from; this stays
    /// available for a target-side dedup or resume feature to query what
    /// the destination already holds.
    pub async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<Extent>, Error> {
        if !self.supports_base_allocation {
            bail!("server did not negotiate the base:allocation metadata context");
        }
        let handle = self.take_handle();
        self.send_request(NBD_CMD_BLOCK_STATUS, offset, length, handle)
            .await?;

        let mut header_buf = vec![0u8; std::mem::size_of::<StructuredReplyHeader>()];
        self.stream.read_exact(&mut header_buf).await?;
        let header: StructuredReplyHeader = Cursor::new(header_buf).read_be_value()?;
        if header.magic != NBD_STRUCTURED_REPLY_MAGIC {
            bail!("unexpected NBD structured reply magic {:#x}", header.magic);
        }
        if header.handle != handle {
            bail!("NBD structured reply handle mismatch");
        }

        let mut payload = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut payload).await?;
        parse_block_status_payload(&payload, offset)
    }

    pub async fn disconnect(mut self) -> Result<(), Error> {
        let handle = self.take_handle();
        self.send_request(NBD_CMD_DISC, 0, 0, handle).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Payload layout after the structured-reply header: `u32` context id, then
/// repeated `(u32 length, u32 status_flags)` pairs. Split out from
/// `block_status` so the parsing logic is testable without a live socket.
fn parse_block_status_payload(payload: &[u8], base_offset: u64) -> Result<Vec<Extent>, Error> {
    if payload.len() < 4 {
        bail!("truncated NBD_CMD_BLOCK_STATUS reply");
    }
    let mut extents = Vec::new();
    let mut pos = 4; // skip context id
    let mut running_offset = base_offset;
    while pos + 8 <= payload.len() {
        let ext_len = u32::from_be_bytes(payload[pos..pos + 4].try_into().unwrap());
        let flags = u32::from_be_bytes(payload[pos + 4..pos + 8].try_into().unwrap());
        extents.push(Extent {
            offset: running_offset,
            length: ext_len,
            is_hole: flags & NBD_STATE_HOLE != 0,
        });
        running_offset += ext_len as u64;
        pos += 8;
    }
    Ok(extents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alternating_hole_and_data_extents() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes()); // context id
        payload.extend_from_slice(&65536u32.to_be_bytes());
        payload.extend_from_slice(&NBD_STATE_HOLE.to_be_bytes());
        payload.extend_from_slice(&4096u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());

        let extents = parse_block_status_payload(&payload, 1_000_000).unwrap();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0], Extent { offset: 1_000_000, length: 65536, is_hole: true });
        assert_eq!(extents[1], Extent { offset: 1_065_536, length: 4096, is_hole: false });
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(parse_block_status_payload(&[0u8; 2], 0).is_err());
    }
}

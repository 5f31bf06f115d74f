//! Logical peer messages and their binary framing.
//!
//! Request frame:
//! ```text
//! "HCXQ" | version u16 | page_size u32 | n_tokens u32 | token u32 * n_tokens
//! ```
//! Response frame:
//! ```text
//! "HCXF" | version u16 | page_size u32 | cached_tokens u64 | n_pages u32
//!        | (page_index u32 | key u64 | len u32 | payload) * n_pages
//! ```
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::TransferError;
use crate::cache::block::{BlockKey, TokenId};

const REQUEST_MAGIC: &[u8; 4] = b"HCXQ";
const RESPONSE_MAGIC: &[u8; 4] = b"HCXF";
const VERSION: u16 = 1;

/// Ask a peer for the pages backing a token prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub token_ids: Vec<TokenId>,
    pub page_size: usize,
}

/// One page of computed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePayload {
    pub page_index: usize,
    pub key: BlockKey,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Tokens the peer itself served from cache for this prefix.
    pub cached_tokens: usize,
    pub page_size: usize,
    /// Pages `0..pages.len()` of the requested prefix, in order.
    pub pages: Vec<PagePayload>,
}

fn malformed(reason: &str) -> TransferError {
    TransferError::Malformed(reason.to_string())
}

fn check_header(buf: &mut Bytes, magic: &[u8; 4]) -> Result<(), TransferError> {
    if buf.remaining() < 6 {
        return Err(malformed("truncated header"));
    }
    if &buf[..4] != magic {
        return Err(malformed("bad magic"));
    }
    buf.advance(4);
    let version = buf.get_u16();
    if version != VERSION {
        return Err(malformed("unsupported version"));
    }
    Ok(())
}

pub fn encode_request(req: &FetchRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(14 + req.token_ids.len() * 4);
    buf.put_slice(REQUEST_MAGIC);
    buf.put_u16(VERSION);
    buf.put_u32(req.page_size as u32);
    buf.put_u32(req.token_ids.len() as u32);
    for &t in &req.token_ids {
        buf.put_u32(t);
    }
    buf.freeze()
}

pub fn decode_request(mut buf: Bytes) -> Result<FetchRequest, TransferError> {
    check_header(&mut buf, REQUEST_MAGIC)?;
    if buf.remaining() < 8 {
        return Err(malformed("truncated request"));
    }
    let page_size = buf.get_u32() as usize;
    let n_tokens = buf.get_u32() as usize;
    if buf.remaining() != n_tokens * 4 {
        return Err(malformed("token count does not match body"));
    }
    let token_ids = (0..n_tokens).map(|_| buf.get_u32()).collect();
    Ok(FetchRequest {
        token_ids,
        page_size,
    })
}

pub fn encode_response(resp: &FetchResponse) -> Bytes {
    let body: usize = resp.pages.iter().map(|p| 16 + p.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(22 + body);
    buf.put_slice(RESPONSE_MAGIC);
    buf.put_u16(VERSION);
    buf.put_u32(resp.page_size as u32);
    buf.put_u64(resp.cached_tokens as u64);
    buf.put_u32(resp.pages.len() as u32);
    for page in &resp.pages {
        buf.put_u32(page.page_index as u32);
        buf.put_u64(page.key.0);
        buf.put_u32(page.payload.len() as u32);
        buf.put_slice(&page.payload);
    }
    buf.freeze()
}

/// Decode a response frame. Payloads are zero-copy slices of `buf`.
pub fn decode_response(mut buf: Bytes) -> Result<FetchResponse, TransferError> {
    check_header(&mut buf, RESPONSE_MAGIC)?;
    if buf.remaining() < 16 {
        return Err(malformed("truncated response"));
    }
    let page_size = buf.get_u32() as usize;
    let cached_tokens = buf.get_u64() as usize;
    let n_pages = buf.get_u32() as usize;

    let mut pages = Vec::with_capacity(n_pages.min(4096));
    for _ in 0..n_pages {
        if buf.remaining() < 16 {
            return Err(malformed("truncated page header"));
        }
        let page_index = buf.get_u32() as usize;
        let key = BlockKey(buf.get_u64());
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(malformed("truncated page payload"));
        }
        let payload = buf.split_to(len);
        pages.push(PagePayload {
            page_index,
            key,
            payload,
        });
    }
    if buf.has_remaining() {
        return Err(malformed("trailing bytes"));
    }

    Ok(FetchResponse {
        cached_tokens,
        page_size,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame() {
        let req = FetchRequest {
            token_ids: vec![1, 2, 70000],
            page_size: 64,
        };
        let frame = encode_request(&req);
        assert_eq!(&frame[..4], b"HCXQ");
        assert_eq!(decode_request(frame).unwrap(), req);
    }

    #[test]
    fn test_response_frame_keeps_payloads() {
        let resp = FetchResponse {
            cached_tokens: 128,
            page_size: 64,
            pages: vec![
                PagePayload {
                    page_index: 0,
                    key: BlockKey(11),
                    payload: Bytes::from_static(b"first"),
                },
                PagePayload {
                    page_index: 1,
                    key: BlockKey(12),
                    payload: Bytes::from_static(b""),
                },
            ],
        };
        assert_eq!(decode_response(encode_response(&resp)).unwrap(), resp);
    }

    #[test]
    fn test_truncated_response_rejected() {
        let resp = FetchResponse {
            cached_tokens: 0,
            page_size: 4,
            pages: vec![PagePayload {
                page_index: 0,
                key: BlockKey(1),
                payload: Bytes::from_static(b"abcdef"),
            }],
        };
        let frame = encode_response(&resp);
        let cut = frame.slice(..frame.len() - 2);
        assert!(matches!(decode_response(cut), Err(TransferError::Malformed(_))));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let frame = encode_request(&FetchRequest {
            token_ids: vec![],
            page_size: 4,
        });
        assert!(decode_response(frame).is_err());
    }
}

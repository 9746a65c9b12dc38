//! Seal-hash encoding.
//!
//! The hash a producer signs covers the fifteen legacy header fields with
//! the 65-byte seal stripped from extra-data. Encoding the short form and
//! the full form with the same routine would let the two collide, so the
//! encoder insists on the seal space being present.

use crate::{error::BorError, header::Header, EXTRA_SEAL};
use alloy_primitives::{keccak256, B256};
use alloy_rlp::Encodable;

/// Hash of a header prior to it being sealed.
pub fn seal_hash(header: &Header) -> Result<B256, BorError> {
    Ok(keccak256(bor_rlp(header)?))
}

/// The RLP bytes a producer signs: the header with the seal suffix of
/// extra-data left out. Fails when extra-data cannot hold a seal.
pub fn bor_rlp(header: &Header) -> Result<Vec<u8>, BorError> {
    if header.extra.len() < EXTRA_SEAL {
        return Err(BorError::MissingSignature);
    }
    let unsigned_extra = &header.extra[..header.extra.len() - EXTRA_SEAL];

    let mut payload = Vec::with_capacity(512);
    header.parent_hash.encode(&mut payload);
    header.uncle_hash.encode(&mut payload);
    header.coinbase.encode(&mut payload);
    header.state_root.encode(&mut payload);
    header.tx_root.encode(&mut payload);
    header.receipt_root.encode(&mut payload);
    header.bloom.encode(&mut payload);
    header.difficulty.encode(&mut payload);
    header.number.encode(&mut payload);
    header.gas_limit.encode(&mut payload);
    header.gas_used.encode(&mut payload);
    header.time.encode(&mut payload);
    unsigned_extra.encode(&mut payload);
    header.mix_digest.encode(&mut payload);
    header.nonce.encode(&mut payload);

    let mut out = Vec::with_capacity(payload.len() + 4);
    alloy_rlp::Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    Ok(out)
}

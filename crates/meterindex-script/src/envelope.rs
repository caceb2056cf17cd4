//! Script-engine envelope: `prefix ‖ rlp([[version, module_id], payload])`.

use meterindex_core::error::DecodeError;

use crate::auction::AuctionBody;
use crate::rlp::{encode_bytes, encode_list, encode_u64, item_bytes, item_u32, list_items};
use crate::staking::StakingBody;

/// Marks clause data as a script-engine call.
pub const SCRIPT_PREFIX: [u8; 8] = [0xff, 0xff, 0xff, 0xff, 0xde, 0xad, 0xbe, 0xef];

pub const STAKING_MODULE: u32 = 1000;
pub const AUCTION_MODULE: u32 = 1001;

/// A decoded script-engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCall {
    Staking(StakingBody),
    Auction(AuctionBody),
}

impl ScriptCall {
    pub fn module_id(&self) -> u32 {
        match self {
            Self::Staking(_) => STAKING_MODULE,
            Self::Auction(_) => AUCTION_MODULE,
        }
    }

    /// Full clause data for this call, prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Self::Staking(body) => body.encode(),
            Self::Auction(body) => body.encode(),
        };
        let header = encode_list(&[encode_u64(0), encode_u64(u64::from(self.module_id()))]);
        let mut out = SCRIPT_PREFIX.to_vec();
        out.extend(encode_list(&[header, encode_bytes(&payload)]));
        out
    }
}

pub fn is_script_data(data: &[u8]) -> bool {
    data.starts_with(&SCRIPT_PREFIX)
}

/// Decode clause data. `Ok(None)` for a well-formed envelope addressed to a
/// module this indexer does not track.
pub fn decode_script(data: &[u8]) -> Result<Option<ScriptCall>, DecodeError> {
    let body = data
        .strip_prefix(SCRIPT_PREFIX.as_slice())
        .ok_or(DecodeError::NotScriptData)?;

    let items = list_items(body)?;
    let [header, payload] = items.as_slice() else {
        return Err(DecodeError::Rlp {
            reason: format!("envelope has {} items, expected 2", items.len()),
        });
    };
    let header = list_items(header)?;
    let module_id = match header.as_slice() {
        [_version, module] => item_u32(module, "module_id")?,
        other => {
            return Err(DecodeError::Rlp {
                reason: format!("envelope header has {} items, expected 2", other.len()),
            })
        }
    };
    let payload = item_bytes(payload)?;

    match module_id {
        STAKING_MODULE => StakingBody::decode(payload).map(|b| Some(ScriptCall::Staking(b))),
        AUCTION_MODULE => AuctionBody::decode(payload).map(|b| Some(ScriptCall::Auction(b))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::AuctionOp;
    use meterindex_core::amount::U256;

    fn start_call() -> ScriptCall {
        ScriptCall::Auction(AuctionBody {
            opcode: AuctionOp::Start,
            version: 0,
            option: 0,
            start_height: 100,
            start_epoch: 2,
            end_height: 0,
            end_epoch: 0,
            sequence: 3,
            auction_id: format!("0x{}", "ab".repeat(32)),
            bidder: format!("0x{}", "00".repeat(20)),
            amount: U256::ZERO,
            reserve_amount: U256::from(1_000),
            token: 1,
            timestamp: 1_700_000_000,
            nonce: 42,
        })
    }

    #[test]
    fn prefix_gate() {
        assert!(is_script_data(&start_call().encode()));
        assert!(!is_script_data(&[0xa9, 0x05, 0x9c, 0xbb]));
        assert!(matches!(decode_script(&[0x01, 0x02]), Err(DecodeError::NotScriptData)));
    }

    #[test]
    fn auction_call_decodes_back() {
        let call = start_call();
        assert_eq!(decode_script(&call.encode()).unwrap(), Some(call));
    }

    #[test]
    fn unknown_module_is_ignored() {
        let header = encode_list(&[encode_u64(0), encode_u64(1002)]);
        let mut data = SCRIPT_PREFIX.to_vec();
        data.extend(encode_list(&[header, encode_bytes(b"whatever")]));
        assert_eq!(decode_script(&data).unwrap(), None);
    }

    #[test]
    fn garbage_after_prefix_is_a_decode_error() {
        let mut data = SCRIPT_PREFIX.to_vec();
        data.extend([0xc3, 0x01]);
        assert!(matches!(decode_script(&data), Err(DecodeError::Rlp { .. })));
    }
}

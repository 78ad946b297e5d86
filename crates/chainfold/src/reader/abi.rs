//! Log decoding for the EVM primitives and the primary chain's input contract.
//!
//! Decodes from the JSON-RPC log shape (eth_getLogs result) into [LogRecord], then into
//! typed payloads.

use super::ReaderError;
use crate::datum::{DatumPayload, SubmittedInput};
use alloy::primitives::{Address, B256, U256};
use serde_json::Value;
use sha3::{Digest, Keccak256};

/// ERC-20 and ERC-721 share the signature; ERC-721 indexes the token id (4 topics).
pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";
pub const ACCOUNT_CREATED_EVENT: &str =
    "ERC6551AccountCreated(address,address,bytes32,uint256,address,uint256)";
/// Emitted by the primary chain's input contract for every submitted input.
pub const INPUT_SUBMITTED_EVENT: &str = "InputSubmitted(address,uint256,bytes)";

/// topic0 for an event signature.
pub fn event_topic(signature: &str) -> B256 {
    B256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// One decoded JSON-RPC log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogRecord {
    pub fn from_json(log: &Value) -> Result<Self, ReaderError> {
        let address = parse_address(str_field(log, "address")?)?;
        let block_number = parse_hex_u64(str_field(log, "blockNumber")?)?;
        let log_index = parse_hex_u64(str_field(log, "logIndex")?)?;
        let tx_hash = parse_b256(str_field(log, "transactionHash")?)?;
        let data = parse_hex_bytes(str_field(log, "data")?)?;
        let topics = log
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or_else(|| ReaderError::Decode("log missing topics".into()))?
            .iter()
            .map(|t| {
                t.as_str()
                    .ok_or_else(|| ReaderError::Decode("topic not string".into()))
                    .and_then(parse_b256)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            address,
            topics,
            data,
            block_number,
            tx_hash,
            log_index,
        })
    }

    fn topic(&self, index: usize) -> Result<&B256, ReaderError> {
        self.topics.get(index).ok_or_else(|| {
            ReaderError::Decode(format!(
                "expected topic {index}, got {} topics",
                self.topics.len()
            ))
        })
    }

    fn word(&self, index: usize) -> Result<&[u8], ReaderError> {
        let start = index * 32;
        self.data.get(start..start + 32).ok_or_else(|| {
            ReaderError::Decode(format!("data too short for word {index} ({} bytes)", self.data.len()))
        })
    }

    /// ABI `bytes` whose head offset sits at word `index`.
    fn dynamic_bytes(&self, index: usize) -> Result<&[u8], ReaderError> {
        let offset = word_to_usize(self.word(index)?)?;
        let len_word = self
            .data
            .get(offset..offset + 32)
            .ok_or_else(|| ReaderError::Decode(format!("data too short for bytes at offset {offset}")))?;
        let len = word_to_usize(len_word)?;
        self.data
            .get(offset + 32..offset + 32 + len)
            .ok_or_else(|| ReaderError::Decode(format!("data too short for bytes len {len}")))
    }
}

fn word_to_address(word: &[u8]) -> Address {
    // Indexed/ABI address is 32 bytes, left-padded; take last 20.
    Address::from_slice(&word[word.len() - 20..])
}

fn word_to_usize(word: &[u8]) -> Result<usize, ReaderError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(ReaderError::Decode("ABI offset/length out of range".into()));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..32]);
    usize::try_from(u64::from_be_bytes(tail))
        .map_err(|_| ReaderError::Decode("ABI offset/length out of range".into()))
}

/// ERC-20 `Transfer(from indexed, to indexed, value)`.
pub fn decode_fungible_transfer(log: &LogRecord) -> Result<DatumPayload, ReaderError> {
    if log.topics.len() != 3 {
        return Err(ReaderError::Decode(format!(
            "ERC-20 Transfer expects 3 topics, got {}",
            log.topics.len()
        )));
    }
    Ok(DatumPayload::FungibleTransfer {
        from: word_to_address(log.topic(1)?.as_slice()),
        to: word_to_address(log.topic(2)?.as_slice()),
        value: U256::from_be_slice(log.word(0)?),
        tx_hash: log.tx_hash,
        log_index: log.log_index,
    })
}

/// ERC-721 `Transfer(from indexed, to indexed, tokenId indexed)`.
pub fn decode_nft_transfer(log: &LogRecord) -> Result<DatumPayload, ReaderError> {
    if log.topics.len() != 4 {
        return Err(ReaderError::Decode(format!(
            "ERC-721 Transfer expects 4 topics, got {}",
            log.topics.len()
        )));
    }
    Ok(DatumPayload::NftTransfer {
        from: word_to_address(log.topic(1)?.as_slice()),
        to: word_to_address(log.topic(2)?.as_slice()),
        token_id: U256::from_be_slice(log.topic(3)?.as_slice()),
        tx_hash: log.tx_hash,
        log_index: log.log_index,
    })
}

/// `ERC6551AccountCreated(account, implementation indexed, salt, chainId,
/// tokenContract indexed, tokenId indexed)`.
pub fn decode_bound_account(log: &LogRecord) -> Result<DatumPayload, ReaderError> {
    Ok(DatumPayload::BoundAccount {
        account: word_to_address(log.word(0)?),
        implementation: word_to_address(log.topic(1)?.as_slice()),
        salt: B256::from_slice(log.word(1)?),
        chain_id: U256::from_be_slice(log.word(2)?),
        token_contract: word_to_address(log.topic(2)?.as_slice()),
        token_id: U256::from_be_slice(log.topic(3)?.as_slice()),
    })
}

pub fn decode_generic(log: &LogRecord) -> DatumPayload {
    DatumPayload::GenericLog {
        address: log.address,
        topics: log.topics.clone(),
        data: format!("0x{}", hex::encode(&log.data)),
        tx_hash: log.tx_hash,
        log_index: log.log_index,
    }
}

/// Factory event: the new contract address is in `address_topic`, or the first data word.
pub fn decode_dynamic(log: &LogRecord, address_topic: Option<usize>) -> Result<DatumPayload, ReaderError> {
    let contract = match address_topic {
        Some(i) => word_to_address(log.topic(i)?.as_slice()),
        None => word_to_address(log.word(0)?),
    };
    Ok(DatumPayload::DynamicPrimitive {
        contract,
        tx_hash: log.tx_hash,
        log_index: log.log_index,
    })
}

/// `InputSubmitted(user indexed, nonce, data)`. Non-UTF-8 data is malformed.
pub fn decode_input_submitted(log: &LogRecord) -> Result<SubmittedInput, ReaderError> {
    let user_address = word_to_address(log.topic(1)?.as_slice());
    let nonce = U256::from_be_slice(log.word(0)?);
    let raw = log.dynamic_bytes(1)?;
    let data = std::str::from_utf8(raw)
        .map_err(|e| ReaderError::Decode(format!("input data not UTF-8: {e}")))?
        .to_string();
    Ok(SubmittedInput {
        user_address,
        nonce,
        data,
        tx_hash: log.tx_hash,
        log_index: log.log_index,
    })
}

/// `0x`-prefixed lowercase hex.
pub fn hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// String field of a JSON-RPC object.
pub fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str, ReaderError> {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ReaderError::Decode(format!("missing {name}")))
}

pub fn parse_hex_u64(s: &str) -> Result<u64, ReaderError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| ReaderError::Decode(format!("parse hex u64: {e}")))
}

pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, ReaderError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| ReaderError::Decode(format!("parse hex bytes: {e}")))
}

pub fn parse_b256(s: &str) -> Result<B256, ReaderError> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        return Err(ReaderError::Decode(format!("expected 32 bytes, got {}", bytes.len())));
    }
    Ok(B256::from_slice(&bytes))
}

pub fn parse_address(s: &str) -> Result<Address, ReaderError> {
    let bytes = parse_hex_bytes(s)?;
    match bytes.len() {
        20 => Ok(Address::from_slice(&bytes)),
        32 => Ok(word_to_address(&bytes)),
        n => Err(ReaderError::Decode(format!(
            "expected 20 or 32 bytes for address, got {n}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn word_hex(bytes: &[u8]) -> String {
        let mut w = [0u8; 32];
        w[32 - bytes.len()..].copy_from_slice(bytes);
        hex::encode(w)
    }

    pub(crate) fn log_json(address: Address, topics: Vec<B256>, data: Vec<u8>, block: u64, index: u64) -> Value {
        json!({
            "address": format!("0x{}", hex::encode(address.as_slice())),
            "topics": topics.iter().map(|t| format!("0x{}", hex::encode(t.as_slice()))).collect::<Vec<_>>(),
            "data": format!("0x{}", hex::encode(data)),
            "blockNumber": format!("0x{:x}", block),
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "logIndex": format!("0x{:x}", index),
        })
    }

    fn topic_of(addr: Address) -> B256 {
        B256::left_padding_from(addr.as_slice())
    }

    #[test]
    fn transfer_topic_constant() {
        assert_eq!(
            hex::encode(event_topic(TRANSFER_EVENT).as_slice()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn decodes_erc20_transfer() {
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        let token = Address::repeat_byte(0xee);
        let raw = log_json(
            token,
            vec![event_topic(TRANSFER_EVENT), topic_of(from), topic_of(to)],
            hex::decode(word_hex(&[50])).unwrap(),
            105,
            3,
        );
        let log = LogRecord::from_json(&raw).unwrap();
        assert_eq!(log.block_number, 105);
        assert_eq!(log.log_index, 3);
        match decode_fungible_transfer(&log).unwrap() {
            DatumPayload::FungibleTransfer {
                from: f, to: t, value, ..
            } => {
                assert_eq!(f, from);
                assert_eq!(t, to);
                assert_eq!(value, U256::from(50u64));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(decode_nft_transfer(&log).is_err());
    }

    #[test]
    fn decodes_nft_mint() {
        let to = Address::repeat_byte(0x02);
        let raw = log_json(
            Address::repeat_byte(0xee),
            vec![
                event_topic(TRANSFER_EVENT),
                B256::ZERO,
                topic_of(to),
                B256::left_padding_from(&[7]),
            ],
            vec![],
            9,
            0,
        );
        let log = LogRecord::from_json(&raw).unwrap();
        match decode_nft_transfer(&log).unwrap() {
            DatumPayload::NftTransfer { from, token_id, .. } => {
                assert_eq!(from, Address::ZERO);
                assert_eq!(token_id, U256::from(7u64));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn decodes_input_submitted() {
        let user = Address::repeat_byte(0x42);
        let payload = b"move|3|4";
        let mut data = hex::decode(word_hex(&[9])).unwrap();
        data.extend(hex::decode(word_hex(&[0x40])).unwrap());
        data.extend(hex::decode(word_hex(&[payload.len() as u8])).unwrap());
        let mut padded = payload.to_vec();
        padded.resize(32, 0);
        data.extend(padded);
        let raw = log_json(
            Address::repeat_byte(0xaa),
            vec![event_topic(INPUT_SUBMITTED_EVENT), topic_of(user)],
            data,
            50,
            0,
        );
        let input = decode_input_submitted(&LogRecord::from_json(&raw).unwrap()).unwrap();
        assert_eq!(input.user_address, user);
        assert_eq!(input.nonce, U256::from(9u64));
        assert_eq!(input.data, "move|3|4");
    }

    #[test]
    fn rejects_truncated_input() {
        let raw = log_json(
            Address::repeat_byte(0xaa),
            vec![event_topic(INPUT_SUBMITTED_EVENT), B256::ZERO],
            hex::decode(word_hex(&[1])).unwrap(),
            50,
            0,
        );
        let log = LogRecord::from_json(&raw).unwrap();
        assert!(matches!(decode_input_submitted(&log), Err(ReaderError::Decode(_))));
    }

    #[test]
    fn parse_address_accepts_padded_word() {
        let addr = Address::repeat_byte(0x07);
        let padded = format!("0x{}", word_hex(addr.as_slice()));
        assert_eq!(parse_address(&padded).unwrap(), addr);
        assert!(parse_address("0x1234").is_err());
    }
}

//! Template payload decoding.
//!
//! Coinservers publish templates as JSON documents. This module is the trust
//! boundary: every field is validated here into typed structure so job
//! assembly never touches raw payload values.

use std::str::FromStr;

use bitcoin::{BlockHash, Txid};
use serde::Deserialize;

use super::{Template, TemplateError, TemplateKey, TemplateType};
use crate::u256::U256;

/// A live template parsed into chain-specific structure.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub key: TemplateKey,
    pub height: u64,
    pub bits: u32,
    pub target: U256,
    /// Block reward in base units (coinbasevalue for the base chain, the aux
    /// chain's subsidy otherwise).
    pub coinbase_value: i64,
    pub role: TemplateRole,
}

/// The chain-specific half of a template.
#[derive(Debug, Clone)]
pub enum TemplateRole {
    /// Anchors the Bitcoin-style header that miners actually hash.
    Base {
        prev_hash: BlockHash,
        version: i32,
        curtime: u32,
        payout_script: Vec<u8>,
        transactions: Vec<TemplateTx>,
    },
    /// Rides along in the aux commitment of the base coinbase.
    Aux(AuxInfo),
}

/// A non-coinbase transaction selected by the base chain's daemon.
#[derive(Debug, Clone)]
pub struct TemplateTx {
    pub data: Vec<u8>,
    pub txid: Txid,
}

/// Aux-chain data needed for the commitment and for block assembly on solve.
#[derive(Debug, Clone)]
pub struct AuxInfo {
    /// Chain identifier; fixes the commitment slot and the proof's index.
    pub chain_id: u32,
    /// Hash of the aux block header, the value committed in the parent
    /// coinbase.
    pub hash: BlockHash,
    /// The serialized aux block as the daemon proposed it; the aux-PoW proof
    /// is spliced in after its 80-byte header on solve.
    pub block: Vec<u8>,
}

#[derive(Deserialize)]
struct RawTemplate {
    height: u64,
    bits: String,
    coinbasevalue: i64,
    #[serde(default)]
    previousblockhash: Option<String>,
    #[serde(default)]
    version: Option<i32>,
    #[serde(default)]
    curtime: Option<u32>,
    #[serde(default)]
    payout_script: Option<String>,
    #[serde(default)]
    transactions: Vec<RawTx>,
    #[serde(default)]
    chainid: Option<u32>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    block: Option<String>,
}

#[derive(Deserialize)]
struct RawTx {
    data: String,
    txid: String,
}

impl BlockTemplate {
    /// Parse and validate a transport-form template.
    pub fn parse(template: &Template) -> Result<Self, TemplateError> {
        let raw: RawTemplate = serde_json::from_slice(&template.data)?;
        let ty = template.key.template_type;

        let bits = u32::from_str_radix(&raw.bits, 16).map_err(|e| TemplateError::BadField {
            field: "bits",
            reason: e.to_string(),
        })?;
        let target = U256::from_compact(bits);

        let role = match ty {
            TemplateType::Base => {
                let prev_hash = require(ty, "previousblockhash", raw.previousblockhash)?;
                let payout_script = require(ty, "payout_script", raw.payout_script)?;
                let mut transactions = Vec::with_capacity(raw.transactions.len());
                for tx in &raw.transactions {
                    transactions.push(TemplateTx {
                        data: decode_hex("transactions.data", &tx.data)?,
                        txid: Txid::from_str(&tx.txid).map_err(|e| TemplateError::BadField {
                            field: "transactions.txid",
                            reason: e.to_string(),
                        })?,
                    });
                }
                TemplateRole::Base {
                    prev_hash: BlockHash::from_str(&prev_hash).map_err(|e| {
                        TemplateError::BadField {
                            field: "previousblockhash",
                            reason: e.to_string(),
                        }
                    })?,
                    version: require(ty, "version", raw.version)?,
                    curtime: require(ty, "curtime", raw.curtime)?,
                    payout_script: decode_hex("payout_script", &payout_script)?,
                    transactions,
                }
            }
            TemplateType::Aux => {
                let hash = require(ty, "hash", raw.hash)?;
                let block = decode_hex("block", &require(ty, "block", raw.block)?)?;
                if block.len() < 81 {
                    return Err(TemplateError::BadField {
                        field: "block",
                        reason: format!("{} bytes is shorter than a header", block.len()),
                    });
                }
                TemplateRole::Aux(AuxInfo {
                    chain_id: require(ty, "chainid", raw.chainid)?,
                    hash: BlockHash::from_str(&hash).map_err(|e| TemplateError::BadField {
                        field: "hash",
                        reason: e.to_string(),
                    })?,
                    block,
                })
            }
        };

        Ok(Self {
            key: template.key.clone(),
            height: raw.height,
            bits,
            target,
            coinbase_value: raw.coinbasevalue,
            role,
        })
    }
}

fn require<T>(
    ty: TemplateType,
    field: &'static str,
    value: Option<T>,
) -> Result<T, TemplateError> {
    value.ok_or(TemplateError::MissingField(ty, field))
}

fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, TemplateError> {
    hex::decode(value).map_err(|e| TemplateError::BadField {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Algo;
    use serde_json::json;

    fn base_key() -> TemplateKey {
        TemplateKey {
            algo: Algo::Sha256d,
            currency: "BTC".into(),
            template_type: TemplateType::Base,
        }
    }

    fn aux_key() -> TemplateKey {
        TemplateKey {
            algo: Algo::Sha256d,
            currency: "NMC".into(),
            template_type: TemplateType::Aux,
        }
    }

    fn base_json() -> serde_json::Value {
        json!({
            "height": 100,
            "bits": "1d00ffff",
            "coinbasevalue": 5_000_000_000i64,
            "previousblockhash":
                "00000000000000000001529600000000000000000000000000000000000000aa",
            "version": 0x2000_0000,
            "curtime": 1_700_000_000u32,
            "payout_script": "76a914000000000000000000000000000000000000000088ac",
            "transactions": []
        })
    }

    #[test]
    fn test_parse_base_template() {
        let template = Template {
            key: base_key(),
            data: serde_json::to_vec(&base_json()).unwrap(),
        };
        let parsed = BlockTemplate::parse(&template).unwrap();
        assert_eq!(parsed.height, 100);
        assert_eq!(parsed.bits, 0x1d00ffff);
        assert_eq!(parsed.coinbase_value, 5_000_000_000);
        match parsed.role {
            TemplateRole::Base {
                curtime,
                version,
                ref payout_script,
                ..
            } => {
                assert_eq!(curtime, 1_700_000_000);
                assert_eq!(version, 0x2000_0000);
                assert_eq!(payout_script.len(), 25);
            }
            TemplateRole::Aux(_) => panic!("expected base role"),
        }
    }

    #[test]
    fn test_parse_base_missing_prevhash() {
        let mut doc = base_json();
        doc.as_object_mut().unwrap().remove("previousblockhash");
        let template = Template {
            key: base_key(),
            data: serde_json::to_vec(&doc).unwrap(),
        };
        assert!(matches!(
            BlockTemplate::parse(&template),
            Err(TemplateError::MissingField(TemplateType::Base, "previousblockhash"))
        ));
    }

    fn aux_block_hex() -> String {
        // 80-byte header plus an empty tx count
        let mut block = vec![0x42u8; 80];
        block.push(0x00);
        hex::encode(block)
    }

    #[test]
    fn test_parse_aux_template() {
        let doc = json!({
            "height": 7,
            "bits": "1e0ffff0",
            "coinbasevalue": 50_000_000i64,
            "chainid": 3,
            "hash": "00000000000000000001529600000000000000000000000000000000000000bb",
            "block": aux_block_hex(),
        });
        let template = Template {
            key: aux_key(),
            data: serde_json::to_vec(&doc).unwrap(),
        };
        let parsed = BlockTemplate::parse(&template).unwrap();
        match parsed.role {
            TemplateRole::Aux(ref aux) => {
                assert_eq!(aux.chain_id, 3);
                assert_eq!(aux.block.len(), 81);
            }
            TemplateRole::Base { .. } => panic!("expected aux role"),
        }
    }

    #[test]
    fn test_parse_aux_missing_chainid() {
        let doc = json!({
            "height": 7,
            "bits": "1e0ffff0",
            "coinbasevalue": 50_000_000i64,
            "hash": "00000000000000000001529600000000000000000000000000000000000000bb",
            "block": aux_block_hex(),
        });
        let template = Template {
            key: aux_key(),
            data: serde_json::to_vec(&doc).unwrap(),
        };
        assert!(matches!(
            BlockTemplate::parse(&template),
            Err(TemplateError::MissingField(TemplateType::Aux, "chainid"))
        ));
    }

    #[test]
    fn test_parse_aux_truncated_block() {
        let doc = json!({
            "height": 7,
            "bits": "1e0ffff0",
            "coinbasevalue": 50_000_000i64,
            "chainid": 3,
            "hash": "00000000000000000001529600000000000000000000000000000000000000bb",
            "block": "00aabb"
        });
        let template = Template {
            key: aux_key(),
            data: serde_json::to_vec(&doc).unwrap(),
        };
        assert!(matches!(
            BlockTemplate::parse(&template),
            Err(TemplateError::BadField { field: "block", .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let template = Template {
            key: base_key(),
            data: b"not json".to_vec(),
        };
        assert!(matches!(
            BlockTemplate::parse(&template),
            Err(TemplateError::BadPayload(_))
        ));
    }

    #[test]
    fn test_parse_bad_bits() {
        let mut doc = base_json();
        doc["bits"] = json!("zzzz");
        let template = Template {
            key: base_key(),
            data: serde_json::to_vec(&doc).unwrap(),
        };
        assert!(matches!(
            BlockTemplate::parse(&template),
            Err(TemplateError::BadField { field: "bits", .. })
        ));
    }
}

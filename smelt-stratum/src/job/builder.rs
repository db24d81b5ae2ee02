//! Job assembly from the live template set.
//!
//! Builds the base-chain coinbase with the aux commitment embedded, splits it
//! around the extranonce region, and precomputes everything a session needs
//! to validate shares and assemble solved blocks.

use std::collections::HashMap;

use super::auxpow::{self, AuxCommitment};
use super::{merkle, ChainSolve, Job, JobError, SolveData};
use crate::template::{BlockTemplate, Template, TemplateRole, TemplateType};

/// Marker appended to the coinbase scriptsig.
const POOL_TAG: &[u8] = b"/smelt/";

/// Server half of the extranonce region, bytes.
const EXTRANONCE1_LEN: usize = 4;

pub(super) fn assemble<'a, I>(
    job_id: String,
    templates: I,
    extranonce2_size: usize,
) -> Result<Job, JobError>
where
    I: IntoIterator<Item = &'a Template>,
{
    let mut base: Option<BlockTemplate> = None;
    let mut auxes: Vec<BlockTemplate> = Vec::new();
    for template in templates {
        let parsed = BlockTemplate::parse(template)?;
        match template.key.template_type {
            TemplateType::Base => {
                if let Some(existing) = &base {
                    return Err(JobError::ConflictingBaseTemplates(
                        existing.key.to_string(),
                        parsed.key.to_string(),
                    ));
                }
                base = Some(parsed);
            }
            TemplateType::Aux => auxes.push(parsed),
        }
    }
    let base = base.ok_or(JobError::NoBaseTemplate)?;
    auxes.sort_by_key(|t| match &t.role {
        TemplateRole::Aux(aux) => aux.chain_id,
        TemplateRole::Base { .. } => unreachable!("aux list holds only aux roles"),
    });

    let (prev_hash, version, curtime, payout_script, transactions) = match &base.role {
        TemplateRole::Base {
            prev_hash,
            version,
            curtime,
            payout_script,
            transactions,
        } => (
            *prev_hash,
            *version,
            *curtime,
            payout_script.clone(),
            transactions,
        ),
        TemplateRole::Aux(_) => unreachable!("base slot holds a base role"),
    };

    // Aux commitment over the live aux chains, chain-id ascending.
    let commitment = if auxes.is_empty() {
        None
    } else {
        let chains: Vec<(u32, bitcoin::BlockHash)> = auxes
            .iter()
            .map(|t| match &t.role {
                TemplateRole::Aux(aux) => (aux.chain_id, aux.hash),
                TemplateRole::Base { .. } => unreachable!(),
            })
            .collect();
        Some(AuxCommitment::build(&chains))
    };

    let (coinbase1, coinbase2) = split_coinbase(
        base.height,
        base.coinbase_value,
        &payout_script,
        commitment.as_ref(),
        EXTRANONCE1_LEN + extranonce2_size,
    );

    let txids: Vec<bitcoin::Txid> = transactions.iter().map(|tx| tx.txid).collect();
    let merkle_branch = merkle::coinbase_branch(&txids);

    let mut targets = HashMap::new();
    let mut heights = HashMap::new();
    let mut chains = Vec::with_capacity(1 + auxes.len());

    targets.insert(base.key.currency.clone(), base.target);
    heights.insert(base.key.currency.clone(), base.height);
    chains.push(ChainSolve {
        currency: base.key.currency.clone(),
        target: base.target,
        height: base.height,
        subsidy: base.coinbase_value,
        data: SolveData::Base {
            transactions: transactions.iter().map(|tx| tx.data.clone()).collect(),
        },
    });

    for (nth, aux) in auxes.iter().enumerate() {
        let info = match &aux.role {
            TemplateRole::Aux(info) => info,
            TemplateRole::Base { .. } => unreachable!(),
        };
        let commitment = commitment
            .as_ref()
            .expect("commitment exists when aux templates do");
        let slot = commitment.slot(nth);
        targets.insert(aux.key.currency.clone(), aux.target);
        heights.insert(aux.key.currency.clone(), aux.height);
        chains.push(ChainSolve {
            currency: aux.key.currency.clone(),
            target: aux.target,
            height: aux.height,
            subsidy: aux.coinbase_value,
            data: SolveData::Aux {
                block: info.block.clone(),
                chain_index: slot,
                chain_branch: commitment.branch(slot),
            },
        });
    }

    Ok(Job {
        id: job_id,
        algo: base.key.algo,
        prev_hash,
        version,
        curtime,
        bits: base.bits,
        extranonce2_size,
        coinbase1,
        coinbase2,
        merkle_branch,
        targets,
        heights,
        chains,
    })
}

/// Serialize the coinbase transaction and split it around the extranonce
/// region so `coinbase1 ‖ extranonce1 ‖ extranonce2 ‖ coinbase2` reproduces
/// the full transaction.
fn split_coinbase(
    height: u64,
    coinbase_value: i64,
    payout_script: &[u8],
    commitment: Option<&AuxCommitment>,
    extranonce_len: usize,
) -> (Vec<u8>, Vec<u8>) {
    let height_push = encode_height(height);
    let script_len = height_push.len() + 1 + extranonce_len + 1 + POOL_TAG.len();

    let mut coinbase1 = Vec::with_capacity(64);
    coinbase1.extend_from_slice(&1i32.to_le_bytes()); // tx version
    coinbase1.push(0x01); // one input
    coinbase1.extend_from_slice(&[0u8; 32]); // null prevout
    coinbase1.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    auxpow::write_varint(&mut coinbase1, script_len as u64);
    coinbase1.extend_from_slice(&height_push);
    coinbase1.push(extranonce_len as u8); // extranonce push opcode

    // ...extranonce1 ‖ extranonce2 goes here...

    let mut coinbase2 = Vec::with_capacity(64 + payout_script.len());
    coinbase2.push(POOL_TAG.len() as u8);
    coinbase2.extend_from_slice(POOL_TAG);
    coinbase2.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence

    let output_count = if commitment.is_some() { 2u64 } else { 1 };
    auxpow::write_varint(&mut coinbase2, output_count);
    coinbase2.extend_from_slice(&(coinbase_value as u64).to_le_bytes());
    auxpow::write_varint(&mut coinbase2, payout_script.len() as u64);
    coinbase2.extend_from_slice(payout_script);
    if let Some(commitment) = commitment {
        let script = commitment.script();
        coinbase2.extend_from_slice(&0u64.to_le_bytes());
        auxpow::write_varint(&mut coinbase2, script.len() as u64);
        coinbase2.extend_from_slice(&script);
    }
    coinbase2.extend_from_slice(&0u32.to_le_bytes()); // locktime

    (coinbase1, coinbase2)
}

/// BIP34 height push: minimal script-number encoding behind a direct push.
fn encode_height(height: u64) -> Vec<u8> {
    let mut num = Vec::new();
    let mut h = height;
    while h > 0 {
        num.push((h & 0xff) as u8);
        h >>= 8;
    }
    if num.is_empty() {
        num.push(0);
    }
    if num.last().copied().unwrap_or(0) & 0x80 != 0 {
        num.push(0);
    }
    let mut out = Vec::with_capacity(1 + num.len());
    out.push(num.len() as u8);
    out.extend_from_slice(&num);
    out
}

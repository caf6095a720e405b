use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, Bytes, TxHash, TxKind, U256},
    signers::local::PrivateKeySigner,
};

use crate::error::{SignError, TemplateErrorKind};

/// Intrinsic gas cost of a plain native-token transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeePolicy {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

/// An unsigned transaction shape. The nonce is deliberately absent:
/// it is assigned at dispatch time by the allocator, not at creation.
#[derive(Clone, Debug)]
pub struct TxTemplate {
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub fees: FeePolicy,
    pub input: Bytes,
    pub chain_id: u64,
}

impl TxTemplate {
    /// Native-token transfer with the minimum gas stipend.
    pub fn transfer(to: Address, value: U256, fees: FeePolicy, chain_id: u64) -> Self {
        Self {
            to,
            value,
            gas_limit: TRANSFER_GAS_LIMIT,
            fees,
            input: Bytes::new(),
            chain_id,
        }
    }

    fn validate(&self) -> Result<(), TemplateErrorKind> {
        if self.gas_limit < TRANSFER_GAS_LIMIT {
            return Err(TemplateErrorKind::GasTooLow(self.gas_limit));
        }
        if self.chain_id == 0 {
            return Err(TemplateErrorKind::ChainIdMissing);
        }
        match self.fees {
            FeePolicy::Legacy { gas_price } => {
                if gas_price == 0 {
                    return Err(TemplateErrorKind::ZeroFee);
                }
            }
            FeePolicy::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                if max_fee_per_gas == 0 {
                    return Err(TemplateErrorKind::ZeroFee);
                }
                if max_priority_fee_per_gas > max_fee_per_gas {
                    return Err(TemplateErrorKind::PriorityFeeTooHigh {
                        priority: max_priority_fee_per_gas,
                        max: max_fee_per_gas,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A signed, network-ready transaction. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTx {
    pub raw: Bytes,
    pub tx_hash: TxHash,
    pub from: Address,
    pub nonce: u64,
}

/// Signs `template` with `nonce` filled in. Pure: no network, no
/// shared state, safe to call from any number of workers at once, and
/// deterministic for a given (key, template, nonce).
pub fn sign_request(
    signer: &PrivateKeySigner,
    template: &TxTemplate,
    nonce: u64,
) -> Result<SignedTx, SignError> {
    template.validate().map_err(SignError::InvalidTemplate)?;

    let envelope: TxEnvelope = match template.fees {
        FeePolicy::Legacy { gas_price } => {
            let mut tx = TxLegacy {
                chain_id: Some(template.chain_id),
                nonce,
                gas_price,
                gas_limit: template.gas_limit,
                to: TxKind::Call(template.to),
                value: template.value,
                input: template.input.clone(),
            };
            let signature = signer.sign_transaction_sync(&mut tx)?;
            tx.into_signed(signature).into()
        }
        FeePolicy::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let mut tx = TxEip1559 {
                chain_id: template.chain_id,
                nonce,
                gas_limit: template.gas_limit,
                max_fee_per_gas,
                max_priority_fee_per_gas,
                to: TxKind::Call(template.to),
                value: template.value,
                input: template.input.clone(),
                ..Default::default()
            };
            let signature = signer.sign_transaction_sync(&mut tx)?;
            tx.into_signed(signature).into()
        }
    };

    Ok(SignedTx {
        raw: envelope.encoded_2718().into(),
        tx_hash: *envelope.tx_hash(),
        from: signer.address(),
        nonce,
    })
}

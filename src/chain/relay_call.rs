//! Hand-rolled ABI encoding for `RelayHub.relayCall`, kept out of the
//! `abigen!` binding in `abi.rs` because its tuple-of-tuples argument makes
//! the nested struct name abigen would assign an implementation detail that
//! can't be pinned down without compiling. `ethers::abi::Function` gives the
//! same selector + encoding guarantees abigen uses internally.

use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, Bytes, U256};
use once_cell::sync::Lazy;

/// The on-chain shape of a relay request's forwarder-facing half.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas: U256,
    pub nonce: U256,
    pub data: Bytes,
    pub valid_until_time: U256,
}

impl ForwardRequest {
    fn into_token(self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.from),
            Token::Address(self.to),
            Token::Uint(self.value),
            Token::Uint(self.gas),
            Token::Uint(self.nonce),
            Token::Bytes(self.data.to_vec()),
            Token::Uint(self.valid_until_time),
        ])
    }
}

/// The on-chain shape of a relay request's relay-economics half.
#[derive(Debug, Clone)]
pub struct RelayData {
    pub relay_worker: Address,
    pub paymaster: Address,
    pub forwarder: Address,
    pub paymaster_data: Bytes,
    pub client_id: U256,
}

impl RelayData {
    fn into_token(self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.relay_worker),
            Token::Address(self.paymaster),
            Token::Address(self.forwarder),
            Token::Bytes(self.paymaster_data.to_vec()),
            Token::Uint(self.client_id),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub request: ForwardRequest,
    pub relay_data: RelayData,
}

fn forward_request_param(name: &str) -> Param {
    Param {
        name: name.to_owned(),
        kind: ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Uint(256),
        ]),
        internal_type: None,
    }
}

fn relay_data_param(name: &str) -> Param {
    Param {
        name: name.to_owned(),
        kind: ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Address,
            ParamType::Bytes,
            ParamType::Uint(256),
        ]),
        internal_type: None,
    }
}

#[allow(deprecated)] // `Function.constant` has no replacement in ethabi 18
static RELAY_CALL_FUNCTION: Lazy<Function> = Lazy::new(|| Function {
    name: "relayCall".to_owned(),
    inputs: vec![
        Param {
            name: "acceptanceBudget".to_owned(),
            kind: ParamType::Uint(256),
            internal_type: None,
        },
        Param {
            name: "relayRequest".to_owned(),
            kind: ParamType::Tuple(vec![
                forward_request_param("request").kind,
                relay_data_param("relayData").kind,
            ]),
            internal_type: None,
        },
        Param {
            name: "signature".to_owned(),
            kind: ParamType::Bytes,
            internal_type: None,
        },
        Param {
            name: "approvalData".to_owned(),
            kind: ParamType::Bytes,
            internal_type: None,
        },
        Param {
            name: "maxPossibleGas".to_owned(),
            kind: ParamType::Uint(256),
            internal_type: None,
        },
    ],
    outputs: vec![
        Param {
            name: "paymasterAccepted".to_owned(),
            kind: ParamType::Bool,
            internal_type: None,
        },
        Param {
            name: "returnValue".to_owned(),
            kind: ParamType::Bytes,
            internal_type: None,
        },
    ],
    constant: None,
    state_mutability: StateMutability::NonPayable,
});

pub fn encode_relay_call(
    acceptance_budget: U256,
    relay_request: RelayRequest,
    signature: Bytes,
    approval_data: Bytes,
    max_possible_gas: U256,
) -> Bytes {
    let tokens = vec![
        Token::Uint(acceptance_budget),
        Token::Tuple(vec![
            relay_request.request.into_token(),
            relay_request.relay_data.into_token(),
        ]),
        Token::Bytes(signature.to_vec()),
        Token::Bytes(approval_data.to_vec()),
        Token::Uint(max_possible_gas),
    ];

    RELAY_CALL_FUNCTION
        .encode_input(&tokens)
        .expect("relayCall tokens match the declared signature")
        .into()
}

/// Decodes the `(bool paymasterAccepted, bytes returnValue)` result of a
/// simulated `relayCall`.
pub fn decode_relay_call_output(output: &[u8]) -> ethers::abi::Result<bool> {
    let tokens = RELAY_CALL_FUNCTION.decode_output(output)?;
    Ok(tokens
        .first()
        .and_then(|token| token.clone().into_bool())
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_correct_selector() {
        let request = RelayRequest {
            request: ForwardRequest {
                from: Address::zero(),
                to: Address::zero(),
                value: U256::zero(),
                gas: U256::from(100_000u64),
                nonce: U256::zero(),
                data: Bytes::default(),
                valid_until_time: U256::zero(),
            },
            relay_data: RelayData {
                relay_worker: Address::zero(),
                paymaster: Address::zero(),
                forwarder: Address::zero(),
                paymaster_data: Bytes::default(),
                client_id: U256::zero(),
            },
        };

        let encoded = encode_relay_call(
            U256::from(50_000u64),
            request,
            Bytes::default(),
            Bytes::default(),
            U256::from(500_000u64),
        );

        assert_eq!(&encoded[0..4], RELAY_CALL_FUNCTION.short_signature().as_slice());
    }
}

//! Homomorphic-encryption and range-proof operations offered to contracts.
//!
//! The runtime does not ship these primitives. Nodes plug an implementation
//! in through [`CryptoProvider`]; without one, the syscalls fail.

use chain_vm_common::{KvCodec, SyscallError};

/// Paillier and bulletproofs operations.
///
/// `op` names the operation and `args` carries its operands as sent by the
/// contract. The returned bytes are handed back through the length-probe
/// protocol.
pub trait CryptoProvider: Send + Sync {
    /// Run a Paillier operation.
    fn paillier(&self, op: &str, args: &KvCodec) -> Result<Vec<u8>, SyscallError>;

    /// Run a bulletproofs operation.
    fn bulletproofs(&self, op: &str, args: &KvCodec) -> Result<Vec<u8>, SyscallError>;
}

/// Provider that rejects every operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedCrypto;

impl CryptoProvider for UnsupportedCrypto {
    fn paillier(&self, op: &str, _args: &KvCodec) -> Result<Vec<u8>, SyscallError> {
        Err(SyscallError::Crypto {
            reason: format!("paillier operation [{op}] is not supported"),
        })
    }

    fn bulletproofs(&self, op: &str, _args: &KvCodec) -> Result<Vec<u8>, SyscallError> {
        Err(SyscallError::Crypto {
            reason: format!("bulletproofs operation [{op}] is not supported"),
        })
    }
}

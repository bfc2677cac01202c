//! 请求签名模块
//!
//! - `pow`: PoW 求解
//! - `key_material`: HMAC 密钥派生
//! - `fingerprint`: 设备指纹
//! - `signer`: 每次请求的签名头生成

pub mod fingerprint;
pub mod key_material;
pub mod pow;
pub mod signer;

pub use fingerprint::DeviceFingerprint;
pub use key_material::SigningKeyMaterial;
pub use pow::{PowSolution, ProofOfWorkSolver};
pub use signer::{RequestSigner, SignatureInput, SignedHeaders};

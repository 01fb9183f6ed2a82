//! Algorithm registry: negotiable names mapped to factories.
//!
//! Each category is a list of `&'static` descriptors. A descriptor carries
//! the sizes the key exchange needs to derive key material and a plain
//! function pointer that builds the primitive. Registries are ordinary
//! values; sessions with different policies hold different registries.
//!
//! ```rust
//! use kestrel_proto::ssh::registry::{AlgorithmRegistry, Preferences};
//!
//! let registry = AlgorithmRegistry::default()
//!     .restrict(&["curve25519-sha256", "ssh-ed25519", "aes128-ctr", "hmac-sha2-256", "none"]);
//! let prefs = Preferences::from_registry(&registry);
//! assert_eq!(prefs.cipher_c2s, vec!["aes128-ctr".to_string()]);
//! assert!(prefs.validate(&registry).is_ok());
//! ```

use crate::ssh::crypto::{
    AesCtr, AesGcm, CipherState, Compressor, HmacMac, NoCompression, PacketMac,
};
use crate::ssh::error::{Error, Result};
use crate::ssh::hostkey::{self, VerifyFn};
use crate::ssh::kex_dh::{
    Curve25519Kex, FixedGroupKex, GroupExchangeKex, GroupRange, HashAlgorithm, KexMethod,
};
use std::fmt;

/// Cipher descriptor.
pub struct CipherAlgo {
    /// Negotiated name
    pub name: &'static str,
    /// Key length in bytes
    pub key_len: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Cipher block size in bytes
    pub block_size: usize,
    /// AEAD ciphers provide their own integrity and take no MAC
    pub aead: bool,
    /// Builds the cipher from derived key material
    pub make: fn(key: &[u8], iv: &[u8]) -> Result<CipherState>,
}

/// MAC descriptor.
pub struct MacAlgo {
    /// Negotiated name
    pub name: &'static str,
    /// Key length in bytes
    pub key_len: usize,
    /// Tag length in bytes
    pub mac_len: usize,
    /// Encrypt-then-MAC variant
    pub etm: bool,
    /// Builds the MAC from a derived key
    pub make: fn(key: &[u8]) -> Result<Box<dyn PacketMac>>,
}

/// Compression descriptor.
pub struct CompressionAlgo {
    /// Negotiated name
    pub name: &'static str,
    /// Builds a compressor
    pub make: fn() -> Box<dyn Compressor>,
}

/// Key exchange descriptor.
pub struct KexAlgo {
    /// Negotiated name
    pub name: &'static str,
    /// Builds the method state machine
    pub make: fn(range: &GroupRange) -> Box<dyn KexMethod>,
}

/// Host key algorithm descriptor.
pub struct HostKeyAlgo {
    /// Negotiated name
    pub name: &'static str,
    /// Verifies the server's signature over the exchange hash
    pub verify: VerifyFn,
}

macro_rules! impl_debug_name {
    ($($ty:ident),*) => {
        $(impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty)).field("name", &self.name).finish_non_exhaustive()
            }
        })*
    };
}

impl_debug_name!(CipherAlgo, MacAlgo, CompressionAlgo, KexAlgo, HostKeyAlgo);

fn make_ctr(key: &[u8], iv: &[u8]) -> Result<CipherState> {
    Ok(CipherState::Stream(Box::new(AesCtr::new(key, iv)?)))
}

fn make_gcm(key: &[u8], iv: &[u8]) -> Result<CipherState> {
    Ok(CipherState::Aead(Box::new(AesGcm::new(key, iv)?)))
}

/// `aes128-ctr`
pub static AES128_CTR: CipherAlgo = CipherAlgo {
    name: "aes128-ctr",
    key_len: 16,
    iv_len: 16,
    block_size: 16,
    aead: false,
    make: make_ctr,
};

/// `aes192-ctr`
pub static AES192_CTR: CipherAlgo = CipherAlgo {
    name: "aes192-ctr",
    key_len: 24,
    iv_len: 16,
    block_size: 16,
    aead: false,
    make: make_ctr,
};

/// `aes256-ctr`
pub static AES256_CTR: CipherAlgo = CipherAlgo {
    name: "aes256-ctr",
    key_len: 32,
    iv_len: 16,
    block_size: 16,
    aead: false,
    make: make_ctr,
};

/// `aes128-gcm@openssh.com`
pub static AES128_GCM: CipherAlgo = CipherAlgo {
    name: "aes128-gcm@openssh.com",
    key_len: 16,
    iv_len: 12,
    block_size: 16,
    aead: true,
    make: make_gcm,
};

/// `aes256-gcm@openssh.com`
pub static AES256_GCM: CipherAlgo = CipherAlgo {
    name: "aes256-gcm@openssh.com",
    key_len: 32,
    iv_len: 12,
    block_size: 16,
    aead: true,
    make: make_gcm,
};

fn make_hmac_sha1(key: &[u8]) -> Result<Box<dyn PacketMac>> {
    Ok(Box::new(HmacMac::sha1(key)?))
}

fn make_hmac_sha256(key: &[u8]) -> Result<Box<dyn PacketMac>> {
    Ok(Box::new(HmacMac::sha256(key)?))
}

fn make_hmac_sha512(key: &[u8]) -> Result<Box<dyn PacketMac>> {
    Ok(Box::new(HmacMac::sha512(key)?))
}

/// `hmac-sha1`
pub static HMAC_SHA1: MacAlgo = MacAlgo {
    name: "hmac-sha1",
    key_len: 20,
    mac_len: 20,
    etm: false,
    make: make_hmac_sha1,
};

/// `hmac-sha2-256`
pub static HMAC_SHA2_256: MacAlgo = MacAlgo {
    name: "hmac-sha2-256",
    key_len: 32,
    mac_len: 32,
    etm: false,
    make: make_hmac_sha256,
};

/// `hmac-sha2-512`
pub static HMAC_SHA2_512: MacAlgo = MacAlgo {
    name: "hmac-sha2-512",
    key_len: 64,
    mac_len: 64,
    etm: false,
    make: make_hmac_sha512,
};

/// `hmac-sha2-256-etm@openssh.com`
pub static HMAC_SHA2_256_ETM: MacAlgo = MacAlgo {
    name: "hmac-sha2-256-etm@openssh.com",
    key_len: 32,
    mac_len: 32,
    etm: true,
    make: make_hmac_sha256,
};

/// `hmac-sha2-512-etm@openssh.com`
pub static HMAC_SHA2_512_ETM: MacAlgo = MacAlgo {
    name: "hmac-sha2-512-etm@openssh.com",
    key_len: 64,
    mac_len: 64,
    etm: true,
    make: make_hmac_sha512,
};

/// `none`
pub static COMPRESSION_NONE: CompressionAlgo = CompressionAlgo {
    name: "none",
    make: || Box::new(NoCompression),
};

/// `curve25519-sha256`
pub static CURVE25519_SHA256: KexAlgo = KexAlgo {
    name: "curve25519-sha256",
    make: |_| Box::new(Curve25519Kex::new()),
};

/// `curve25519-sha256@libssh.org`
pub static CURVE25519_SHA256_LIBSSH: KexAlgo = KexAlgo {
    name: "curve25519-sha256@libssh.org",
    make: |_| Box::new(Curve25519Kex::new()),
};

/// `diffie-hellman-group14-sha256`
pub static DH_GROUP14_SHA256: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha256",
    make: |_| Box::new(FixedGroupKex::group14(HashAlgorithm::Sha256)),
};

/// `diffie-hellman-group14-sha1`
pub static DH_GROUP14_SHA1: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha1",
    make: |_| Box::new(FixedGroupKex::group14(HashAlgorithm::Sha1)),
};

/// `diffie-hellman-group-exchange-sha256`
pub static DH_GEX_SHA256: KexAlgo = KexAlgo {
    name: "diffie-hellman-group-exchange-sha256",
    make: |range| Box::new(GroupExchangeKex::new(HashAlgorithm::Sha256, *range)),
};

/// `diffie-hellman-group-exchange-sha1`
pub static DH_GEX_SHA1: KexAlgo = KexAlgo {
    name: "diffie-hellman-group-exchange-sha1",
    make: |range| Box::new(GroupExchangeKex::new(HashAlgorithm::Sha1, *range)),
};

/// `ssh-ed25519`
pub static SSH_ED25519: HostKeyAlgo = HostKeyAlgo {
    name: "ssh-ed25519",
    verify: hostkey::verify_ed25519,
};

/// `ecdsa-sha2-nistp256`
pub static ECDSA_SHA2_NISTP256: HostKeyAlgo = HostKeyAlgo {
    name: "ecdsa-sha2-nistp256",
    verify: hostkey::verify_ecdsa_p256,
};

/// `ecdsa-sha2-nistp384`
pub static ECDSA_SHA2_NISTP384: HostKeyAlgo = HostKeyAlgo {
    name: "ecdsa-sha2-nistp384",
    verify: hostkey::verify_ecdsa_p384,
};

/// `rsa-sha2-512`
pub static RSA_SHA2_512: HostKeyAlgo = HostKeyAlgo {
    name: "rsa-sha2-512",
    verify: hostkey::verify_rsa_sha512,
};

/// `rsa-sha2-256`
pub static RSA_SHA2_256: HostKeyAlgo = HostKeyAlgo {
    name: "rsa-sha2-256",
    verify: hostkey::verify_rsa_sha256,
};

/// `ssh-rsa`
pub static SSH_RSA: HostKeyAlgo = HostKeyAlgo {
    name: "ssh-rsa",
    verify: hostkey::verify_ssh_rsa,
};

/// Algorithms available to a session, in default preference order.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    kex: Vec<&'static KexAlgo>,
    host_key: Vec<&'static HostKeyAlgo>,
    ciphers: Vec<&'static CipherAlgo>,
    macs: Vec<&'static MacAlgo>,
    compression: Vec<&'static CompressionAlgo>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self {
            kex: vec![
                &CURVE25519_SHA256,
                &CURVE25519_SHA256_LIBSSH,
                &DH_GEX_SHA256,
                &DH_GROUP14_SHA256,
                &DH_GROUP14_SHA1,
                &DH_GEX_SHA1,
            ],
            host_key: vec![
                &SSH_ED25519,
                &ECDSA_SHA2_NISTP256,
                &ECDSA_SHA2_NISTP384,
                &RSA_SHA2_512,
                &RSA_SHA2_256,
                &SSH_RSA,
            ],
            ciphers: vec![
                &AES256_GCM,
                &AES128_GCM,
                &AES256_CTR,
                &AES192_CTR,
                &AES128_CTR,
            ],
            macs: vec![
                &HMAC_SHA2_256_ETM,
                &HMAC_SHA2_512_ETM,
                &HMAC_SHA2_256,
                &HMAC_SHA2_512,
                &HMAC_SHA1,
            ],
            compression: vec![&COMPRESSION_NONE],
        }
    }
}

impl AlgorithmRegistry {
    /// Registry with no algorithms at all.
    pub fn empty() -> Self {
        Self {
            kex: Vec::new(),
            host_key: Vec::new(),
            ciphers: Vec::new(),
            macs: Vec::new(),
            compression: Vec::new(),
        }
    }

    /// Adds a key exchange method.
    pub fn with_kex(mut self, algo: &'static KexAlgo) -> Self {
        self.kex.push(algo);
        self
    }

    /// Adds a host key algorithm.
    pub fn with_host_key(mut self, algo: &'static HostKeyAlgo) -> Self {
        self.host_key.push(algo);
        self
    }

    /// Adds a cipher.
    pub fn with_cipher(mut self, algo: &'static CipherAlgo) -> Self {
        self.ciphers.push(algo);
        self
    }

    /// Adds a MAC.
    pub fn with_mac(mut self, algo: &'static MacAlgo) -> Self {
        self.macs.push(algo);
        self
    }

    /// Adds a compression method.
    pub fn with_compression(mut self, algo: &'static CompressionAlgo) -> Self {
        self.compression.push(algo);
        self
    }

    /// Keeps only the algorithms named in `names`, whatever their category.
    pub fn restrict(&self, names: &[&str]) -> Self {
        let keep = |name: &str| names.contains(&name);
        Self {
            kex: self.kex.iter().copied().filter(|a| keep(a.name)).collect(),
            host_key: self.host_key.iter().copied().filter(|a| keep(a.name)).collect(),
            ciphers: self.ciphers.iter().copied().filter(|a| keep(a.name)).collect(),
            macs: self.macs.iter().copied().filter(|a| keep(a.name)).collect(),
            compression: self
                .compression
                .iter()
                .copied()
                .filter(|a| keep(a.name))
                .collect(),
        }
    }

    /// Looks up a key exchange method.
    pub fn kex(&self, name: &str) -> Option<&'static KexAlgo> {
        self.kex.iter().copied().find(|a| a.name == name)
    }

    /// Looks up a host key algorithm.
    pub fn host_key(&self, name: &str) -> Option<&'static HostKeyAlgo> {
        self.host_key.iter().copied().find(|a| a.name == name)
    }

    /// Looks up a cipher.
    pub fn cipher(&self, name: &str) -> Option<&'static CipherAlgo> {
        self.ciphers.iter().copied().find(|a| a.name == name)
    }

    /// Looks up a MAC.
    pub fn mac(&self, name: &str) -> Option<&'static MacAlgo> {
        self.macs.iter().copied().find(|a| a.name == name)
    }

    /// Looks up a compression method.
    pub fn compression(&self, name: &str) -> Option<&'static CompressionAlgo> {
        self.compression.iter().copied().find(|a| a.name == name)
    }
}

/// Ordered algorithm names the client proposes, per KEXINIT category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers client to server
    pub cipher_c2s: Vec<String>,
    /// Ciphers server to client
    pub cipher_s2c: Vec<String>,
    /// MACs client to server
    pub mac_c2s: Vec<String>,
    /// MACs server to client
    pub mac_s2c: Vec<String>,
    /// Compression client to server
    pub compression_c2s: Vec<String>,
    /// Compression server to client
    pub compression_s2c: Vec<String>,
}

impl Preferences {
    /// Proposes everything in `registry`, in registry order.
    pub fn from_registry(registry: &AlgorithmRegistry) -> Self {
        fn names<T>(list: &[&'static T], name: fn(&T) -> &'static str) -> Vec<String> {
            list.iter().map(|a| name(a).to_string()).collect()
        }
        let ciphers = names(&registry.ciphers, |a: &CipherAlgo| a.name);
        let macs = names(&registry.macs, |a: &MacAlgo| a.name);
        let compression = names(&registry.compression, |a: &CompressionAlgo| a.name);

        Self {
            kex: names(&registry.kex, |a: &KexAlgo| a.name),
            host_key: names(&registry.host_key, |a: &HostKeyAlgo| a.name),
            cipher_c2s: ciphers.clone(),
            cipher_s2c: ciphers,
            mac_c2s: macs.clone(),
            mac_s2c: macs,
            compression_c2s: compression.clone(),
            compression_s2c: compression,
        }
    }

    /// Checks that every category is non-empty and every name is registered.
    ///
    /// A MAC list may be empty only when every cipher in that direction is
    /// AEAD.
    pub fn validate(&self, registry: &AlgorithmRegistry) -> Result<()> {
        fn check(
            category: &str,
            names: &[String],
            known: impl Fn(&str) -> bool,
            allow_empty: bool,
        ) -> Result<()> {
            if names.is_empty() && !allow_empty {
                return Err(Error::Config(format!("no {} algorithms configured", category)));
            }
            match names.iter().find(|n| !known(n.as_str())) {
                Some(unknown) => Err(Error::Config(format!(
                    "unknown {} algorithm '{}'",
                    category, unknown
                ))),
                None => Ok(()),
            }
        }
        let all_aead = |names: &[String]| {
            names
                .iter()
                .all(|n| registry.cipher(n).map_or(false, |c| c.aead))
        };

        check("kex", &self.kex, |n| registry.kex(n).is_some(), false)?;
        check("host key", &self.host_key, |n| registry.host_key(n).is_some(), false)?;
        check("cipher", &self.cipher_c2s, |n| registry.cipher(n).is_some(), false)?;
        check("cipher", &self.cipher_s2c, |n| registry.cipher(n).is_some(), false)?;
        check(
            "MAC",
            &self.mac_c2s,
            |n| registry.mac(n).is_some(),
            all_aead(&self.cipher_c2s),
        )?;
        check(
            "MAC",
            &self.mac_s2c,
            |n| registry.mac(n).is_some(),
            all_aead(&self.cipher_s2c),
        )?;
        check(
            "compression",
            &self.compression_c2s,
            |n| registry.compression(n).is_some(),
            false,
        )?;
        check(
            "compression",
            &self.compression_s2c,
            |n| registry.compression(n).is_some(),
            false,
        )
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::from_registry(&AlgorithmRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_lookup() {
        let registry = AlgorithmRegistry::default();
        assert_eq!(registry.cipher("aes256-ctr").unwrap().key_len, 32);
        assert!(registry.cipher("aes128-gcm@openssh.com").unwrap().aead);
        assert!(registry.mac("hmac-sha2-256-etm@openssh.com").unwrap().etm);
        assert_eq!(registry.mac("hmac-sha1").unwrap().mac_len, 20);
        assert!(registry.kex("diffie-hellman-group-exchange-sha1").is_some());
        assert!(registry.host_key("ssh-ed25519").is_some());
        assert!(registry.cipher("chacha20-poly1305@openssh.com").is_none());
    }

    #[test]
    fn test_factories_build_primitives() {
        let registry = AlgorithmRegistry::default();
        for name in ["aes128-ctr", "aes192-ctr", "aes256-ctr", "aes128-gcm@openssh.com"] {
            let algo = registry.cipher(name).unwrap();
            let state = (algo.make)(&vec![1; algo.key_len], &vec![2; algo.iv_len]).unwrap();
            assert_eq!(state.block_size(), algo.block_size);
            assert_eq!(state.is_aead(), algo.aead);
        }
        let mac = registry.mac("hmac-sha2-512").unwrap();
        assert_eq!((mac.make)(&[0; 64]).unwrap().mac_size(), 64);

        let mut method = (registry.kex("curve25519-sha256").unwrap().make)(&GroupRange::default());
        assert_eq!(method.hash(), HashAlgorithm::Sha256);
        assert_eq!(method.start().unwrap().code(), 30);
    }

    #[test]
    fn test_restrict_keeps_order() {
        let registry =
            AlgorithmRegistry::default().restrict(&["aes128-ctr", "aes256-ctr", "hmac-sha1"]);
        let prefs = Preferences::from_registry(&registry);
        assert_eq!(prefs.cipher_c2s, vec!["aes256-ctr", "aes128-ctr"]);
        assert_eq!(prefs.mac_s2c, vec!["hmac-sha1"]);
        assert!(prefs.kex.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_and_empty() {
        let registry = AlgorithmRegistry::default();
        let mut prefs = Preferences::default();
        assert!(prefs.validate(&registry).is_ok());

        prefs.cipher_c2s = vec!["blowfish-cbc".into()];
        assert!(matches!(prefs.validate(&registry), Err(Error::Config(_))));

        let mut prefs = Preferences::default();
        prefs.kex.clear();
        assert!(matches!(prefs.validate(&registry), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_allows_no_mac_with_aead_only() {
        let registry = AlgorithmRegistry::default();
        let mut prefs = Preferences::default();
        prefs.cipher_c2s = vec!["aes256-gcm@openssh.com".into()];
        prefs.mac_c2s.clear();
        assert!(prefs.validate(&registry).is_ok());

        prefs.cipher_c2s.push("aes128-ctr".into());
        assert!(prefs.validate(&registry).is_err());
    }
}

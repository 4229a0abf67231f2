use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use crate::{
    error::{Error, ErrorKind, Result},
    ProtocolVersion,
};

bitflags! {
    /// Key exchange, authentication, encryption and MAC algorithm bits of
    /// a cipher suite, also used for the capability masks of a
    /// certificate set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Algorithms: u32 {
        /// RSA key transport
        const K_RSA = 0x0000_0001;
        /// Fixed DH, RSA signed certificate
        const K_DHR = 0x0000_0002;
        /// Fixed DH, DSA signed certificate
        const K_DHD = 0x0000_0004;
        /// Ephemeral DH
        const K_EDH = 0x0000_0008;
        /// Fixed ECDH
        const K_ECDH = 0x0000_0010;
        /// Ephemeral ECDH
        const K_ECDHE = 0x0000_0020;

        /// RSA authentication
        const A_RSA = 0x0000_0100;
        /// DSS authentication
        const A_DSS = 0x0000_0200;
        /// No authentication
        const A_NULL = 0x0000_0400;
        /// Fixed DH authentication
        const A_DH = 0x0000_0800;
        /// ECDSA authentication
        const A_ECDSA = 0x0000_1000;

        /// No encryption
        const E_NULL = 0x0001_0000;
        /// RC4
        const RC4 = 0x0002_0000;
        /// Single DES
        const DES = 0x0004_0000;
        /// Triple DES
        const TRIPLE_DES = 0x0008_0000;
        /// AES with 128 bit keys
        const AES128 = 0x0010_0000;
        /// AES with 256 bit keys
        const AES256 = 0x0020_0000;

        /// MD5 MAC
        const MD5 = 0x0100_0000;
        /// SHA1 MAC
        const SHA1 = 0x0200_0000;

        /// All key exchange bits
        const MKEY_MASK = Self::K_RSA.bits()
            | Self::K_DHR.bits()
            | Self::K_DHD.bits()
            | Self::K_EDH.bits()
            | Self::K_ECDH.bits()
            | Self::K_ECDHE.bits();
        /// All authentication bits
        const AUTH_MASK = Self::A_RSA.bits()
            | Self::A_DSS.bits()
            | Self::A_NULL.bits()
            | Self::A_DH.bits()
            | Self::A_ECDSA.bits();
    }
}

/// Strength class of a cipher suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strength {
    /// No encryption at all
    Null,
    /// Export grade, 512 bit key exchange limit
    Export40,
    /// Export grade, 1024 bit key exchange limit
    Export56,
    /// Single DES
    Low,
    /// 128 bit stream ciphers
    Medium,
    /// Everything stronger
    High,
}

/// A registered cipher suite.
#[derive(Debug, PartialEq, Eq)]
pub struct CipherSuite {
    /// Suite name
    pub name: &'static str,
    /// Two byte wire identifier
    pub id: u16,
    /// Algorithm bits
    pub algorithms: Algorithms,
    /// Strength class
    pub strength: Strength,
    /// Effective symmetric key bits
    pub strength_bits: u32,
    /// Only available from TLSv1 onwards
    pub tls1: bool,
}

impl CipherSuite {
    /// Whether this is an export grade suite
    pub fn is_export(&self) -> bool {
        matches!(self.strength, Strength::Export40 | Strength::Export56)
    }

    /// Maximum public key size, in bits, usable for key exchange under
    /// export restrictions
    pub fn export_pkey_length(&self) -> u32 {
        if self.strength == Strength::Export56 {
            1024
        } else {
            512
        }
    }

    /// Key exchange and authentication bits
    pub fn kx_auth(&self) -> Algorithms {
        self.algorithms & (Algorithms::MKEY_MASK | Algorithms::AUTH_MASK)
    }

    /// Whether the suite may be negotiated under `version`
    pub fn usable_with(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::SslV2 | ProtocolVersion::SslV3 => !self.tls1,
            // Stream ciphers do not survive datagram loss
            ProtocolVersion::DtlsV1 => !self.algorithms.contains(Algorithms::RC4),
            ProtocolVersion::TlsV1 | ProtocolVersion::Unknown => true,
        }
    }

    /// Finds a suite by wire id
    pub fn lookup(id: u16) -> Option<&'static CipherSuite> {
        CIPHER_SUITES.iter().find(|c| c.id == id)
    }

    /// Finds a suite by name
    pub fn by_name(name: &str) -> Option<&'static CipherSuite> {
        CIPHER_SUITES.iter().find(|c| c.name == name)
    }
}

/// Renegotiation information signalling suite value
pub const RENEGOTIATION_SCSV: u16 = 0x00FF;
/// Fallback signalling suite value
pub const FALLBACK_SCSV: u16 = 0x5600;

macro_rules! suite {
    ($name:literal, $id:literal, $alg:expr, $strength:ident, $bits:literal, $tls1:literal) => {
        CipherSuite {
            name: $name,
            id: $id,
            algorithms: $alg,
            strength: Strength::$strength,
            strength_bits: $bits,
            tls1: $tls1,
        }
    };
}

const fn alg(bits: u32) -> Algorithms {
    Algorithms::from_bits_retain(bits)
}

const RSA: u32 = Algorithms::K_RSA.bits() | Algorithms::A_RSA.bits();
const EDH_RSA: u32 = Algorithms::K_EDH.bits() | Algorithms::A_RSA.bits();
const EDH_DSS: u32 = Algorithms::K_EDH.bits() | Algorithms::A_DSS.bits();
const ADH: u32 = Algorithms::K_EDH.bits() | Algorithms::A_NULL.bits();
const SHA1: u32 = Algorithms::SHA1.bits();
const MD5: u32 = Algorithms::MD5.bits();
const AES128: u32 = Algorithms::AES128.bits();
const AES256: u32 = Algorithms::AES256.bits();
const TDES: u32 = Algorithms::TRIPLE_DES.bits();
const DES: u32 = Algorithms::DES.bits();
const RC4: u32 = Algorithms::RC4.bits();

/// Every suite known to the library, in default preference order.
pub static CIPHER_SUITES: &[CipherSuite] = &[
    suite!("DHE-RSA-AES256-SHA", 0x0039, alg(EDH_RSA | AES256 | SHA1), High, 256, true),
    suite!("AES256-SHA", 0x0035, alg(RSA | AES256 | SHA1), High, 256, true),
    suite!("ECDHE-ECDSA-AES128-SHA", 0xC009, alg(Algorithms::K_ECDHE.bits() | Algorithms::A_ECDSA.bits() | AES128 | SHA1), High, 128, true),
    suite!("ECDHE-RSA-AES128-SHA", 0xC013, alg(Algorithms::K_ECDHE.bits() | Algorithms::A_RSA.bits() | AES128 | SHA1), High, 128, true),
    suite!("ECDH-ECDSA-AES128-SHA", 0xC004, alg(Algorithms::K_ECDH.bits() | Algorithms::A_ECDSA.bits() | AES128 | SHA1), High, 128, true),
    suite!("ECDH-RSA-AES128-SHA", 0xC00E, alg(Algorithms::K_ECDH.bits() | Algorithms::A_RSA.bits() | AES128 | SHA1), High, 128, true),
    suite!("DHE-RSA-AES128-SHA", 0x0033, alg(EDH_RSA | AES128 | SHA1), High, 128, true),
    suite!("DHE-DSS-AES128-SHA", 0x0032, alg(EDH_DSS | AES128 | SHA1), High, 128, true),
    suite!("DH-RSA-AES128-SHA", 0x0031, alg(Algorithms::K_DHR.bits() | Algorithms::A_DH.bits() | AES128 | SHA1), High, 128, true),
    suite!("DH-DSS-AES128-SHA", 0x0030, alg(Algorithms::K_DHD.bits() | Algorithms::A_DH.bits() | AES128 | SHA1), High, 128, true),
    suite!("AES128-SHA", 0x002F, alg(RSA | AES128 | SHA1), High, 128, true),
    suite!("AECDH-AES128-SHA", 0xC018, alg(Algorithms::K_ECDHE.bits() | Algorithms::A_NULL.bits() | AES128 | SHA1), High, 128, true),
    suite!("ADH-AES128-SHA", 0x0034, alg(ADH | AES128 | SHA1), High, 128, true),
    suite!("EDH-RSA-DES-CBC3-SHA", 0x0016, alg(EDH_RSA | TDES | SHA1), High, 168, false),
    suite!("EDH-DSS-DES-CBC3-SHA", 0x0013, alg(EDH_DSS | TDES | SHA1), High, 168, false),
    suite!("DES-CBC3-SHA", 0x000A, alg(RSA | TDES | SHA1), High, 168, false),
    suite!("ADH-DES-CBC3-SHA", 0x001B, alg(ADH | TDES | SHA1), High, 168, false),
    suite!("RC4-SHA", 0x0005, alg(RSA | RC4 | SHA1), Medium, 128, false),
    suite!("RC4-MD5", 0x0004, alg(RSA | RC4 | MD5), Medium, 128, false),
    suite!("ADH-RC4-MD5", 0x0018, alg(ADH | RC4 | MD5), Medium, 128, false),
    suite!("DES-CBC-SHA", 0x0009, alg(RSA | DES | SHA1), Low, 56, false),
    suite!("EXP1024-RC4-SHA", 0x0064, alg(RSA | RC4 | SHA1), Export56, 56, true),
    suite!("EXP1024-DES-CBC-SHA", 0x0062, alg(RSA | DES | SHA1), Export56, 56, true),
    suite!("EXP-EDH-RSA-DES-CBC-SHA", 0x0014, alg(EDH_RSA | DES | SHA1), Export40, 40, false),
    suite!("EXP-EDH-DSS-DES-CBC-SHA", 0x0011, alg(EDH_DSS | DES | SHA1), Export40, 40, false),
    suite!("EXP-DES-CBC-SHA", 0x0008, alg(RSA | DES | SHA1), Export40, 40, false),
    suite!("EXP-RC4-MD5", 0x0003, alg(RSA | RC4 | MD5), Export40, 40, false),
    suite!("NULL-SHA", 0x0002, alg(RSA | Algorithms::E_NULL.bits() | SHA1), Null, 0, false),
    suite!("NULL-MD5", 0x0001, alg(RSA | Algorithms::E_NULL.bits() | MD5), Null, 0, false),
];

/// Rule used when nothing else is configured.
pub const DEFAULT_CIPHER_RULE: &str = "DEFAULT";

/// An ordered selection of cipher suites, with a copy sorted by id for
/// lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CipherList {
    ordered: Vec<&'static CipherSuite>,
    by_id: Vec<&'static CipherSuite>,
}

fn alias_matches(alias: &str, suite: &CipherSuite) -> Option<bool> {
    let a = suite.algorithms;
    let hit = match alias {
        "ALL" => !a.contains(Algorithms::E_NULL),
        "aNULL" => a.contains(Algorithms::A_NULL),
        "ADH" => a.contains(Algorithms::K_EDH | Algorithms::A_NULL),
        "eNULL" | "NULL" => a.contains(Algorithms::E_NULL),
        "EXPORT" | "EXP" => suite.is_export(),
        "EXPORT40" => suite.strength == Strength::Export40,
        "EXPORT56" => suite.strength == Strength::Export56,
        "LOW" => suite.strength == Strength::Low,
        "MEDIUM" => suite.strength == Strength::Medium,
        "HIGH" => suite.strength == Strength::High,
        "RSA" | "kRSA" => a.contains(Algorithms::K_RSA),
        "aRSA" => a.contains(Algorithms::A_RSA),
        "EDH" | "DHE" | "kEDH" => a.contains(Algorithms::K_EDH),
        "DSS" | "aDSS" => a.contains(Algorithms::A_DSS),
        "DH" => a.intersects(Algorithms::K_DHR | Algorithms::K_DHD | Algorithms::K_EDH),
        "ECDH" | "kECDH" => a.contains(Algorithms::K_ECDH),
        "ECDHE" | "EECDH" | "kECDHE" => a.contains(Algorithms::K_ECDHE),
        "aECDSA" | "ECDSA" => a.contains(Algorithms::A_ECDSA),
        "AES" => a.intersects(Algorithms::AES128 | Algorithms::AES256),
        "3DES" => a.contains(Algorithms::TRIPLE_DES),
        "DES" => a.contains(Algorithms::DES),
        "RC4" => a.contains(Algorithms::RC4),
        "MD5" => a.contains(Algorithms::MD5),
        "SHA" | "SHA1" => a.contains(Algorithms::SHA1),
        _ => return None,
    };
    Some(hit)
}

fn token_matches(token: &str, suite: &CipherSuite) -> bool {
    alias_matches(token, suite).unwrap_or(suite.name == token)
}

impl CipherList {
    /// Builds a list from a rule string such as `"DEFAULT"` or
    /// `"AES128-SHA:RC4-SHA"`, keeping only suites usable with
    /// `version`.
    pub fn new(rule: &str, version: ProtocolVersion) -> Result<Self> {
        let mut selected: Vec<&'static CipherSuite> = Vec::new();
        let mut banned: Vec<u16> = Vec::new();

        let rule = rule.replace(DEFAULT_CIPHER_RULE, "ALL:!aNULL:!eNULL");
        for token in rule
            .split([':', ',', ' ', ';'])
            .filter(|t| !t.is_empty())
        {
            let (op, name) = match token.as_bytes()[0] {
                b'!' | b'-' | b'+' => (token.as_bytes()[0], &token[1..]),
                _ => (0, token),
            };
            let matching = CIPHER_SUITES.iter().filter(|c| token_matches(name, c));
            match op {
                b'!' => {
                    for c in matching {
                        banned.push(c.id);
                        selected.retain(|s| s.id != c.id);
                    }
                }
                b'-' => {
                    for c in matching {
                        selected.retain(|s| s.id != c.id);
                    }
                }
                b'+' => {
                    let moved: Vec<_> = selected
                        .iter()
                        .copied()
                        .filter(|s| token_matches(name, s))
                        .collect();
                    selected.retain(|s| !token_matches(name, s));
                    selected.extend(moved);
                }
                _ => {
                    for c in matching {
                        if !banned.contains(&c.id) && !selected.iter().any(|s| s.id == c.id) {
                            selected.push(c);
                        }
                    }
                }
            }
        }

        selected.retain(|c| c.usable_with(version));
        if selected.is_empty() {
            return Err(Error::fatal(ErrorKind::NoCipherMatch));
        }
        Ok(Self::from_suites(selected))
    }

    pub(crate) fn from_suites(ordered: Vec<&'static CipherSuite>) -> Self {
        let mut by_id = ordered.clone();
        by_id.sort_by_key(|c| c.id);
        Self { ordered, by_id }
    }

    /// Suites in preference order
    pub fn iter(&self) -> impl Iterator<Item = &'static CipherSuite> + '_ {
        self.ordered.iter().copied()
    }

    /// Suites sorted by ascending id
    pub fn by_id(&self) -> &[&'static CipherSuite] {
        &self.by_id
    }

    /// Number of suites
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// The `n`th suite in preference order
    pub fn get(&self, n: usize) -> Option<&'static CipherSuite> {
        self.ordered.get(n).copied()
    }

    /// Finds a suite by id
    pub fn find(&self, id: u16) -> Option<&'static CipherSuite> {
        self.by_id
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| self.by_id[i])
    }

    /// Names in preference order, joined with `:`
    pub fn names(&self) -> String {
        self.ordered
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Writes a cipher code `width` bytes wide. SSLv2 style three byte codes
/// carry a leading zero.
pub(crate) fn put_cipher_code(id: u16, width: usize, out: &mut BytesMut) -> usize {
    if width == 3 {
        out.put_u8(0);
    }
    out.put_u16(id);
    width
}

/// Reads a cipher code written by [`put_cipher_code`].
pub(crate) fn get_cipher_code(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [0, hi, lo] | [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn default_excludes_anonymous_and_null() {
        let list = CipherList::new("DEFAULT", ProtocolVersion::TlsV1).unwrap();
        assert!(!list.is_empty());
        assert!(list
            .iter()
            .all(|c| !c.algorithms.intersects(Algorithms::A_NULL | Algorithms::E_NULL)));
    }

    #[test]
    fn by_id_is_sorted_and_complete() {
        let list = CipherList::new("ALL", ProtocolVersion::TlsV1).unwrap();
        assert_eq!(list.by_id().len(), list.len());
        assert!(list.by_id().windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test_case("AES128-SHA:RC4-SHA" => "AES128-SHA:RC4-SHA".to_string())]
    #[test_case("RC4-SHA,AES128-SHA" => "RC4-SHA:AES128-SHA".to_string())]
    #[test_case("RSA:!EXPORT:!LOW:!MEDIUM:!eNULL" => "AES256-SHA:AES128-SHA:DES-CBC3-SHA".to_string())]
    #[test_case("AES128-SHA:RC4-SHA:+AES128-SHA" => "RC4-SHA:AES128-SHA".to_string())]
    #[test_case("ADH:!RC4:!3DES" => "ADH-AES128-SHA".to_string(); "anonymous only")]
    fn rule_parsing(rule: &str) -> String {
        CipherList::new(rule, ProtocolVersion::TlsV1).unwrap().names()
    }

    #[test]
    fn removed_then_added_back() {
        let list = CipherList::new("ALL:-RC4:RC4-MD5", ProtocolVersion::TlsV1).unwrap();
        assert_eq!(list.iter().last().map(|c| c.name), Some("RC4-MD5"));
        assert!(list.find(0x0005).is_none());
    }

    #[test]
    fn banned_stays_banned() {
        let list = CipherList::new("!RC4:ALL", ProtocolVersion::TlsV1).unwrap();
        assert!(list
            .iter()
            .all(|c| !c.algorithms.contains(Algorithms::RC4)));
    }

    #[test_case("NOT-A-CIPHER")]
    #[test_case("")]
    #[test_case("AES128-SHA:!AES")]
    fn no_match(rule: &str) {
        let err = CipherList::new(rule, ProtocolVersion::TlsV1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCipherMatch);
    }

    #[test]
    fn version_filtering() {
        let ssl3 = CipherList::new("ALL", ProtocolVersion::SslV3).unwrap();
        assert!(ssl3.iter().all(|c| !c.tls1));
        let dtls = CipherList::new("ALL", ProtocolVersion::DtlsV1).unwrap();
        assert!(dtls.iter().all(|c| !c.algorithms.contains(Algorithms::RC4)));
        assert_eq!(
            CipherList::new("AES128-SHA", ProtocolVersion::SslV3)
                .unwrap_err()
                .kind(),
            ErrorKind::NoCipherMatch
        );
    }

    #[test_case("EXP-RC4-MD5" => 512)]
    #[test_case("EXP1024-DES-CBC-SHA" => 1024)]
    #[test_case("AES128-SHA" => 512)]
    fn export_pkey_length(name: &str) -> u32 {
        CipherSuite::by_name(name).unwrap().export_pkey_length()
    }

    #[test]
    fn registry_ids_are_unique() {
        let mut ids: Vec<u16> = CIPHER_SUITES.iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), CIPHER_SUITES.len());
    }

    #[test_case(2)]
    #[test_case(3)]
    fn cipher_codes(width: usize) {
        let mut out = BytesMut::new();
        assert_eq!(put_cipher_code(0xC013, width, &mut out), width);
        assert_eq!(out.len(), width);
        assert_eq!(get_cipher_code(&out), Some(0xC013));
    }
}

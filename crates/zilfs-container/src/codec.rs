//! Container byte image: framing, header, trailer
//!
//! ```text
//! offset  size  field
//! 0       8     magic "ZILANT\0\x01"
//! 8       2     version (LE u16)
//! 10      2     flags (LE u16; bit0 decoy, bit1 adaptive, rest reserved)
//! 12      16    header salt
//! 28      32    KDF parameter block (4 x LE u64)
//! 60      4     table length L (LE u32)
//! 64      L     table blob: nonce(12) || AEAD ciphertext
//! 64+L    ...   chunk stream: repeat { LE u32 len; len bytes }
//! EOF-32  32    trailer: keyed BLAKE3 over [0, EOF-32)
//! ```
//!
//! Pure parse/serialize; no file I/O happens here. Header structure is
//! checked before anything else (`Format`/`Version`), then the trailer
//! (`Auth`), and only then the framing of the authenticated body, so
//! any corruption inside the authenticated region reports as `Auth`.

use std::io::Write;
use std::ops::Range;

use zilfs_core::{ZilError, ZilResult};
use zilfs_crypto::{KdfParams, SecretKey, SALT_SIZE};

pub const MAGIC: [u8; 8] = *b"ZILANT\0\x01";
pub const FORMAT_VERSION: u16 = 1;
pub const MAX_SUPPORTED_VERSION: u16 = 1;

/// Magic, version, flags, salt, KDF block
pub const HEADER_LEN: usize = 60;
/// Bytes covered by the table AD: magic, version, flags, salt
pub const TABLE_AD_LEN: usize = 28;
pub const TABLE_OFFSET: usize = HEADER_LEN + 4;
pub const TRAILER_LEN: usize = 32;
/// Smallest well-formed image: header, empty table length, trailer
pub const MIN_IMAGE_LEN: usize = TABLE_OFFSET + TRAILER_LEN;

/// Header flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub const DECOY: Flags = Flags(1 << 0);
    pub const ADAPTIVE: Flags = Flags(1 << 1);
    const KNOWN: u16 = Self::DECOY.0 | Self::ADAPTIVE.0;

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// Reject any reserved bit (2..15).
    pub fn from_bits(bits: u16) -> ZilResult<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(ZilError::format(format!(
                "reserved header flags set: {:#06x}",
                bits & !Self::KNOWN
            )));
        }
        Ok(Flags(bits))
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Cleartext header of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: Flags,
    pub salt: [u8; SALT_SIZE],
    pub kdf: KdfParams,
}

impl Header {
    pub fn new(salt: [u8; SALT_SIZE], kdf: KdfParams) -> Self {
        Self {
            version: FORMAT_VERSION,
            flags: Flags::empty(),
            salt,
            kdf,
        }
    }

    /// Header of a decoy: the flag is set and salt bytes `[0..8)` carry
    /// the expiry as LE Unix seconds (`0` = never).
    pub fn decoy(mut salt: [u8; SALT_SIZE], kdf: KdfParams, expires_at: u64, adaptive: bool) -> Self {
        salt[..8].copy_from_slice(&expires_at.to_le_bytes());
        let flags = if adaptive {
            Flags::DECOY | Flags::ADAPTIVE
        } else {
            Flags::DECOY
        };
        Self {
            version: FORMAT_VERSION,
            flags,
            salt,
            kdf,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&MAGIC);
        out[8..10].copy_from_slice(&self.version.to_le_bytes());
        out[10..12].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[12..28].copy_from_slice(&self.salt);
        for (i, word) in self.kdf.to_block().iter().enumerate() {
            let at = 28 + i * 8;
            out[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> ZilResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ZilError::format(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(ZilError::format("bad magic"));
        }
        let version = read_u16(bytes, 8);
        if version == 0 {
            return Err(ZilError::format("container version 0"));
        }
        if version > MAX_SUPPORTED_VERSION {
            return Err(ZilError::Version {
                found: version,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        let flags = Flags::from_bits(read_u16(bytes, 10))?;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[12..28]);
        let mut block = [0u64; 4];
        for (i, word) in block.iter_mut().enumerate() {
            *word = read_u64(bytes, 28 + i * 8);
        }
        let kdf = KdfParams::from_block(block)?;
        Ok(Self {
            version,
            flags,
            salt,
            kdf,
        })
    }

    /// Associated data of the object table: header bytes `[0..28)`.
    pub fn table_ad(&self) -> [u8; TABLE_AD_LEN] {
        let mut ad = [0u8; TABLE_AD_LEN];
        ad.copy_from_slice(&self.encode()[..TABLE_AD_LEN]);
        ad
    }

    pub fn is_decoy(&self) -> bool {
        self.flags.contains(Flags::DECOY)
    }

    /// Decoy expiry in Unix seconds; `None` for real containers and for
    /// decoys that never expire.
    pub fn decoy_expiry(&self) -> Option<u64> {
        if !self.is_decoy() {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.salt[..8]);
        match u64::from_le_bytes(raw) {
            0 => None,
            t => Some(t),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.decoy_expiry().is_some_and(|t| t <= now)
    }
}

/// Associated data of chunk `index`: `salt || index_le_u32`.
pub fn chunk_ad(salt: &[u8; SALT_SIZE], index: u32) -> [u8; SALT_SIZE + 4] {
    let mut ad = [0u8; SALT_SIZE + 4];
    ad[..SALT_SIZE].copy_from_slice(salt);
    ad[SALT_SIZE..].copy_from_slice(&index.to_le_bytes());
    ad
}

/// Keyed BLAKE3 over everything before the trailer.
pub struct TrailerMac {
    key: SecretKey,
}

impl TrailerMac {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    pub fn tag(&self, body: &[u8]) -> [u8; TRAILER_LEN] {
        *blake3::keyed_hash(self.key.as_bytes(), body).as_bytes()
    }

    fn hasher(&self) -> blake3::Hasher {
        blake3::Hasher::new_keyed(self.key.as_bytes())
    }

    /// Check the trailer of a full image. Comparison is constant-time.
    pub fn verify(&self, image: &[u8]) -> ZilResult<()> {
        if image.len() < MIN_IMAGE_LEN {
            return Err(ZilError::format("image shorter than header and trailer"));
        }
        let (body, trailer) = image.split_at(image.len() - TRAILER_LEN);
        let mut stored = [0u8; TRAILER_LEN];
        stored.copy_from_slice(trailer);
        // blake3::Hash equality is constant-time
        if blake3::keyed_hash(self.key.as_bytes(), body) == blake3::Hash::from(stored) {
            Ok(())
        } else {
            Err(ZilError::Auth)
        }
    }
}

impl std::fmt::Debug for TrailerMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrailerMac([REDACTED])")
    }
}

/// Byte ranges of a parsed image. Ranges index into the image they were
/// parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub header: Header,
    pub table: Range<usize>,
    pub chunks: Vec<Range<usize>>,
}

impl Layout {
    pub fn chunk_lens(&self) -> Vec<usize> {
        self.chunks.iter().map(|r| r.len()).collect()
    }
}

/// Parse and authenticate a full image.
pub fn parse(image: &[u8], trailer: &TrailerMac) -> ZilResult<Layout> {
    let header = Header::decode(image)?;
    trailer.verify(image)?;
    frame(image, header)
}

/// Split an already-authenticated image into table and chunk ranges.
pub fn frame(image: &[u8], header: Header) -> ZilResult<Layout> {
    if image.len() < MIN_IMAGE_LEN {
        return Err(ZilError::format("image shorter than header and trailer"));
    }
    let body_end = image.len() - TRAILER_LEN;
    let table_len = read_u32(image, HEADER_LEN) as usize;
    let table = TABLE_OFFSET..TABLE_OFFSET
        .checked_add(table_len)
        .filter(|end| *end <= body_end)
        .ok_or_else(|| ZilError::format(format!("table length {table_len} overruns image")))?;

    let mut chunks = Vec::new();
    let mut at = table.end;
    while at < body_end {
        if body_end - at < 4 {
            return Err(ZilError::format(format!("dangling bytes at offset {at}")));
        }
        let len = read_u32(image, at) as usize;
        let start = at + 4;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= body_end)
            .ok_or_else(|| {
                ZilError::format(format!("chunk {} length {len} overruns image", chunks.len()))
            })?;
        chunks.push(start..end);
        at = end;
    }

    Ok(Layout {
        header,
        table,
        chunks,
    })
}

/// Stream an image into `out`, trailer included. Returns bytes written.
pub fn write_image<W, C>(
    mut out: W,
    header: &Header,
    table: &[u8],
    chunks: impl IntoIterator<Item = ZilResult<C>>,
    trailer: &TrailerMac,
) -> ZilResult<u64>
where
    W: Write,
    C: AsRef<[u8]>,
{
    let mut mac = trailer.hasher();
    let mut written = 0u64;
    let mut emit = |bytes: &[u8], out: &mut W| -> ZilResult<()> {
        out.write_all(bytes)?;
        mac.update(bytes);
        written += bytes.len() as u64;
        Ok(())
    };

    emit(&header.encode(), &mut out)?;
    emit(&len_prefix(table.len(), "table")?, &mut out)?;
    emit(table, &mut out)?;
    for chunk in chunks {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        emit(&len_prefix(chunk.len(), "chunk")?, &mut out)?;
        emit(chunk, &mut out)?;
    }
    drop(emit);

    let tag = mac.finalize();
    out.write_all(tag.as_bytes())?;
    out.flush()?;
    Ok(written + TRAILER_LEN as u64)
}

/// In-memory form of [`write_image`].
pub fn serialize(
    header: &Header,
    table: &[u8],
    chunks: &[Vec<u8>],
    trailer: &TrailerMac,
) -> ZilResult<Vec<u8>> {
    let mut image = Vec::new();
    write_image(
        &mut image,
        header,
        table,
        chunks.iter().map(|c| Ok(c.as_slice())),
        trailer,
    )?;
    Ok(image)
}

fn len_prefix(len: usize, what: &str) -> ZilResult<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| ZilError::bad_argument(format!("{what} of {len} bytes exceeds u32 framing")))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mac() -> TrailerMac {
        TrailerMac::new(SecretKey::from_bytes([0x5A; 32]))
    }

    fn header() -> Header {
        Header::new([3u8; SALT_SIZE], KdfParams::minimum())
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let bytes = header().encode();
        assert_eq!(&bytes[0..8], b"ZILANT\0\x01");
        assert_eq!(&bytes[8..10], &[1, 0]);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..28], &[3u8; 16]);
        assert_eq!(&bytes[28..36], &65536u64.to_le_bytes());
        assert_eq!(&bytes[52..60], &2u64.to_le_bytes());
        assert_eq!(Header::decode(&bytes).unwrap(), header());
    }

    #[test]
    fn empty_container_layout() {
        let image = serialize(&header(), b"table-blob", &[], &mac()).unwrap();
        assert_eq!(image.len(), TABLE_OFFSET + 10 + TRAILER_LEN);
        assert_eq!(&image[60..64], &10u32.to_le_bytes());
        let layout = parse(&image, &mac()).unwrap();
        assert_eq!(&image[layout.table.clone()], b"table-blob");
        assert!(layout.chunks.is_empty());
    }

    #[test]
    fn chunks_round_trip_through_ranges() {
        let chunks = vec![vec![1u8; 5], vec![], vec![9u8; 300]];
        let image = serialize(&header(), b"t", &chunks, &mac()).unwrap();
        let layout = parse(&image, &mac()).unwrap();
        assert_eq!(layout.chunk_lens(), vec![5, 0, 300]);
        for (range, chunk) in layout.chunks.iter().zip(&chunks) {
            assert_eq!(&image[range.clone()], chunk.as_slice());
        }
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut image = serialize(&header(), b"t", &[], &mac()).unwrap();
        image[0] ^= 0x20;
        assert!(matches!(parse(&image, &mac()), Err(ZilError::Format(_))));
    }

    #[test]
    fn newer_version_is_version_error() {
        let mut bytes = header().encode();
        bytes[8..10].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            Header::decode(&bytes),
            Err(ZilError::Version { found: 2, max: 1 })
        ));
    }

    #[test]
    fn reserved_flags_are_refused() {
        let mut bytes = header().encode();
        bytes[10..12].copy_from_slice(&0b100u16.to_le_bytes());
        assert!(matches!(Header::decode(&bytes), Err(ZilError::Format(_))));
        bytes[10..12].copy_from_slice(&0x8000u16.to_le_bytes());
        assert!(matches!(Header::decode(&bytes), Err(ZilError::Format(_))));
    }

    #[test]
    fn out_of_range_kdf_block_is_format_error() {
        let mut bytes = header().encode();
        bytes[36..44].copy_from_slice(&1u64.to_le_bytes());
        assert!(matches!(Header::decode(&bytes), Err(ZilError::Format(_))));
    }

    #[test]
    fn truncated_image_is_format_error() {
        let image = serialize(&header(), b"t", &[], &mac()).unwrap();
        assert!(matches!(
            parse(&image[..HEADER_LEN + 2], &mac()),
            Err(ZilError::Format(_))
        ));
    }

    #[test]
    fn wrong_trailer_key_is_auth_error() {
        let image = serialize(&header(), b"t", &[vec![1, 2, 3]], &mac()).unwrap();
        let other = TrailerMac::new(SecretKey::from_bytes([0x5B; 32]));
        assert!(matches!(parse(&image, &other), Err(ZilError::Auth)));
    }

    #[test]
    fn decoy_expiry_lives_in_salt() {
        let h = Header::decoy([0xEE; SALT_SIZE], KdfParams::minimum(), 1_700_000_000, true);
        let decoded = Header::decode(&h.encode()).unwrap();
        assert!(decoded.is_decoy());
        assert!(decoded.flags.contains(Flags::ADAPTIVE));
        assert_eq!(decoded.decoy_expiry(), Some(1_700_000_000));
        assert!(decoded.is_expired(1_700_000_000));
        assert!(!decoded.is_expired(1_699_999_999));
        assert_eq!(&decoded.salt[8..], &[0xEE; 8]);

        let never = Header::decoy([0; SALT_SIZE], KdfParams::minimum(), 0, false);
        assert_eq!(never.decoy_expiry(), None);
        assert!(!never.is_expired(u64::MAX));
        assert_eq!(header().decoy_expiry(), None);
    }

    #[test]
    fn chunk_ad_binds_index() {
        let salt = [1u8; SALT_SIZE];
        assert_ne!(chunk_ad(&salt, 0), chunk_ad(&salt, 1));
        assert_eq!(&chunk_ad(&salt, 0x0102_0304)[16..], &[4, 3, 2, 1]);
    }

    #[test]
    fn framing_errors_after_auth_are_format_errors() {
        // A chunk length that overruns, but under a valid trailer
        let mut body = header().encode().to_vec();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(b't');
        body.extend_from_slice(&100u32.to_le_bytes());
        body.extend_from_slice(&[0u8; 3]);
        let tag = mac().tag(&body);
        body.extend_from_slice(&tag);
        assert!(matches!(parse(&body, &mac()), Err(ZilError::Format(_))));
    }

    proptest! {
        #[test]
        fn parse_accepts_every_serialized_image(
            table in proptest::collection::vec(any::<u8>(), 0..256),
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 0..6),
        ) {
            let image = serialize(&header(), &table, &chunks, &mac()).unwrap();
            let layout = parse(&image, &mac()).unwrap();
            prop_assert_eq!(&image[layout.table.clone()], &table[..]);
            prop_assert_eq!(layout.chunks.len(), chunks.len());
        }

        #[test]
        fn any_bit_flip_past_the_header_fails_auth(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..4),
            pick in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut image = serialize(&header(), b"table", &chunks, &mac()).unwrap();
            let at = HEADER_LEN + pick.index(image.len() - HEADER_LEN);
            image[at] ^= 1 << bit;
            prop_assert!(matches!(parse(&image, &mac()), Err(ZilError::Auth)));
        }
    }
}

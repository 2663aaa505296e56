//! Secret scrambling
//!
//! Only the password field is touched. The keystream comes from rand's
//! seedable `StdRng`, seeded with the byte sum of the record's database,
//! schema and osuser fields (full width, padding included), and is XORed
//! over the secret. Applying it twice restores the input. `StdRng` output
//! is pinned by the rand version in Cargo.toml; a rand upgrade that changes
//! it makes existing repositories unreadable.
//!
//! This keeps passwords away from a casual `cat` of the repository. It is
//! not encryption; the file mode and the owner check protect the data.

use std::fmt;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use zeroize::Zeroizing;

use crate::codec::{DatabaseField, FixedField, OsUserField, Record, SchemaField, W_SECRET};
use crate::error::Result;

/// Seed derived from the identity fields of a record
pub fn seed_for(record: &Record) -> u64 {
    record
        .database
        .as_bytes()
        .iter()
        .chain(record.schema.as_bytes())
        .chain(record.osuser.as_bytes())
        .map(|&b| u64::from(b))
        .sum()
}

fn keystream(seed: u64) -> Zeroizing<[u8; W_SECRET]> {
    let mut stream = Zeroizing::new([0u8; W_SECRET]);
    StdRng::seed_from_u64(seed).fill_bytes(&mut stream[..]);
    stream
}

/// Scramble or unscramble the secret in place, keyed by the record's
/// current identity fields.
pub fn apply(record: &mut Record) {
    let stream = keystream(seed_for(record));
    for (b, k) in record.secret.as_bytes_mut().iter_mut().zip(stream.iter()) {
        *b ^= k;
    }
}

/// Build a record holding `plaintext` in scrambled form
pub fn seal(
    database: DatabaseField,
    schema: SchemaField,
    osuser: OsUserField,
    plaintext: &[u8],
) -> Result<Record> {
    let mut record = Record {
        database,
        schema,
        osuser,
        secret: FixedField::from_bytes("password", plaintext)?,
    };
    apply(&mut record);
    Ok(record)
}

/// Unscramble a private copy of the record's secret. The record itself is
/// left as it was.
pub fn reveal(record: &Record) -> PlainSecret {
    let mut copy = record.clone();
    apply(&mut copy);
    let plain = PlainSecret(Zeroizing::new(copy.secret.trimmed().to_vec()));
    copy.secret.as_bytes_mut().fill(0);
    plain
}

/// An unscrambled secret, wiped on drop
#[derive(Clone, PartialEq, Eq)]
pub struct PlainSecret(Zeroizing<Vec<u8>>);

impl PlainSecret {
    pub fn new(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Text view; lossy for secrets that are not valid UTF-8
    pub fn to_text(&self) -> Zeroizing<String> {
        Zeroizing::new(String::from_utf8_lossy(&self.0).into_owned())
    }
}

impl fmt::Debug for PlainSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlainSecret(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(db: &str, schema: &str, osuser: &str) -> (DatabaseField, SchemaField, OsUserField) {
        (
            FixedField::from_text("database", db).unwrap(),
            FixedField::from_text("schemaname", schema).unwrap(),
            FixedField::from_text("osusername", osuser).unwrap(),
        )
    }

    #[test]
    fn test_apply_is_an_involution() {
        let cases = [
            ("PRODDB", "hr", "bob", &b"s3cr3t"[..]),
            ("", "", "", &b""[..]),
            ("X", "y", "z", &[0u8, 1, 2, 255, 0, 7][..]),
            ("PRODDB", "hr", "carol", &[b'p'; 29][..]),
        ];

        for (db, schema, osuser, secret) in cases {
            let (d, s, o) = identity(db, schema, osuser);
            let mut record = Record {
                database: d,
                schema: s,
                osuser: o,
                secret: FixedField::from_bytes("password", secret).unwrap(),
            };
            let original = record.clone();

            apply(&mut record);
            apply(&mut record);
            assert_eq!(record, original);
        }
    }

    #[test]
    fn test_seal_hides_and_reveal_restores() {
        let (d, s, o) = identity("PRODDB", "hr", "bob");
        let record = seal(d, s, o, b"s3cr3t").unwrap();

        assert_ne!(&record.secret.as_bytes()[..6], b"s3cr3t");
        assert_eq!(reveal(&record).as_bytes(), b"s3cr3t");
        // reveal works on a copy
        assert_eq!(reveal(&record).as_bytes(), b"s3cr3t");
    }

    #[test]
    fn test_same_identity_same_keystream() {
        let (d, s, o) = identity("PRODDB", "hr", "bob");
        let a = seal(d, s, o, b"one").unwrap();
        let b = seal(d, s, o, b"one").unwrap();
        assert_eq!(a.secret, b.secret);
    }

    #[test]
    fn test_identity_change_breaks_reveal() {
        let (d, s, o) = identity("PRODDB", "hr", "bob");
        let mut record = seal(d, s, o, b"s3cr3t").unwrap();
        record.osuser = FixedField::from_text("osusername", "mallory").unwrap();
        assert_ne!(reveal(&record).as_bytes(), b"s3cr3t");
    }

    #[test]
    fn test_seed_counts_padding() {
        let (d, s, o) = identity("AB", "c", "d");
        let record = seal(d, s, o, b"").unwrap();
        assert_eq!(seed_for(&record), u64::from(b'A' + b'B') + u64::from(b'c') + u64::from(b'd'));

        let mut dirty = record.clone();
        dirty.database.as_bytes_mut()[40] = 1;
        assert_eq!(seed_for(&dirty), seed_for(&record) + 1);
    }

    #[test]
    fn test_secret_too_long() {
        let (d, s, o) = identity("PRODDB", "hr", "bob");
        assert!(seal(d, s, o, &[b'x'; 30]).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let plain = PlainSecret::new(b"hunter2");
        assert_eq!(format!("{:?}", plain), "PlainSecret(***)");
    }
}

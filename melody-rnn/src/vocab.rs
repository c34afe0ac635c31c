use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

pub const PAD_TOKEN: &str = "<PAD>";
pub const PAD_INDEX: u32 = 0;

/// Fixed bidirectional mapping between note/chord tokens and dense ids.
///
/// Id 0 is always `<PAD>`; observed tokens are sorted and numbered from 1, so
/// the same token set always yields the same ids.
#[derive(Debug, Clone)]
pub struct Vocab {
    tokens: Vec<String>,
    token_to_id: HashMap<String, u32>,
}

impl Vocab {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t| t != PAD_TOKEN)
            .collect();
        let tokens: Vec<String> = unique.into_iter().collect();

        let mut token_to_id: HashMap<String, u32> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32 + 1))
            .collect();
        token_to_id.insert(PAD_TOKEN.to_string(), PAD_INDEX);

        Self {
            tokens,
            token_to_id,
        }
    }

    /// Number of ids, PAD included
    pub fn len(&self) -> usize {
        self.tokens.len() + 1
    }

    /// Never true: PAD is always present
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn pad_index(&self) -> u32 {
        PAD_INDEX
    }

    /// Observed tokens in id order (PAD excluded), as stored in checkpoints
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        match id {
            PAD_INDEX => Some(PAD_TOKEN),
            _ => self.tokens.get(id as usize - 1).map(String::as_str),
        }
    }

    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<u32>> {
        tokens
            .iter()
            .map(|t| {
                let t = t.as_ref();
                self.token_to_id(t)
                    .ok_or_else(|| Error::UnknownToken(t.to_string()))
            })
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter()
            .map(|&id| {
                self.id_to_token(id)
                    .map(str::to_string)
                    .ok_or(Error::UnknownId(id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_is_zero_and_ids_are_sorted() {
        let vocab = Vocab::new(["E4", "C4", "0.4.7", "C4"]);
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.pad_index(), 0);
        assert_eq!(vocab.token_to_id(PAD_TOKEN), Some(0));
        assert_eq!(vocab.tokens(), &["0.4.7", "C4", "E4"]);
        assert_eq!(vocab.encode(&["0.4.7", "C4", "E4"]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let tokens = ["G#3", "B-2", "2.5.9", "A4", "7"];
        let vocab = Vocab::new(tokens);
        let ids = vocab.encode(&tokens).unwrap();
        assert!(ids.iter().all(|&id| id >= 1 && (id as usize) < vocab.len()));
        assert_eq!(vocab.decode(&ids).unwrap(), tokens);
    }

    #[test]
    fn test_rebuild_from_stored_tokens_is_identical() {
        let vocab = Vocab::new(["D4", "A3", "F4"]);
        let rebuilt = Vocab::new(vocab.tokens().to_vec());
        for token in vocab.tokens() {
            assert_eq!(vocab.token_to_id(token), rebuilt.token_to_id(token));
        }
    }

    #[test]
    fn test_unknown_lookups_fail() {
        let vocab = Vocab::new(["C4"]);
        assert!(matches!(
            vocab.encode(&["D4"]),
            Err(Error::UnknownToken(t)) if t == "D4"
        ));
        assert!(matches!(vocab.decode(&[5]), Err(Error::UnknownId(5))));
    }

    #[test]
    fn test_literal_pad_in_input_is_dropped() {
        let vocab = Vocab::new(["<PAD>", "C4"]);
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.decode(&[0, 1]).unwrap(), vec!["<PAD>", "C4"]);
    }
}

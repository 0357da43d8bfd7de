use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use hf_hub::api::sync::Api;
use log::info;
use polars::prelude::*;

const HUB_PREFIX: &str = "hf://";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentencePair {
    pub src: String,
    pub tgt: String,
}

/// Splits `hf://owner/name/path/in/repo` into the dataset repo id and the file.
fn parse_hub_location(location: &str) -> Option<(String, String)> {
    let rest = location.strip_prefix(HUB_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let name = parts.next().filter(|s| !s.is_empty())?;
    let file = parts.next().filter(|s| !s.is_empty())?;

    Some((format!("{owner}/{name}"), file.to_string()))
}

/// Turns a corpus location into a local path, downloading hub files on demand.
pub fn resolve(location: &str) -> Result<PathBuf> {
    if !location.starts_with(HUB_PREFIX) {
        return Ok(PathBuf::from(location));
    }

    let (repo_id, file) = parse_hub_location(location)
        .ok_or_else(|| anyhow!("Expected hf://<owner>/<dataset>/<file>, got {location}"))?;

    info!("Fetching {file} from dataset {repo_id}");
    let path = Api::new()?
        .dataset(repo_id.clone())
        .get(&file)
        .with_context(|| format!("Could not download {file} from {repo_id}"))?;

    Ok(path)
}

pub fn read_pairs(path: &Path, src_column: &str, tgt_column: &str) -> Result<Vec<SentencePair>> {
    let is_parquet = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));

    if is_parquet {
        read_parquet(path, src_column, tgt_column)
    } else {
        let file =
            File::open(path).with_context(|| format!("Could not open corpus {}", path.display()))?;
        read_tsv(BufReader::new(file), &path.display().to_string())
    }
}

fn read_tsv(reader: impl BufRead, name: &str) -> Result<Vec<SentencePair>> {
    let mut pairs = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Could not read {name}"))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let Some((src, tgt)) = line.split_once('\t') else {
            bail!("{name}:{}: expected `source<TAB>target`", idx + 1);
        };

        pairs.push(SentencePair {
            src: src.to_string(),
            tgt: tgt.to_string(),
        });
    }

    Ok(pairs)
}

fn read_parquet(path: &Path, src_column: &str, tgt_column: &str) -> Result<Vec<SentencePair>> {
    let file =
        File::open(path).with_context(|| format!("Could not open corpus {}", path.display()))?;
    let df = ParquetReader::new(file)
        .finish()
        .with_context(|| format!("Could not read parquet {}", path.display()))?;

    string_pairs(&df, src_column, tgt_column)
        .with_context(|| format!("Bad sentence columns in {}", path.display()))
}

fn string_pairs(df: &DataFrame, src_column: &str, tgt_column: &str) -> Result<Vec<SentencePair>> {
    let src = df.column(src_column)?.as_materialized_series().str()?;
    let tgt = df.column(tgt_column)?.as_materialized_series().str()?;

    src.into_iter()
        .zip(tgt.into_iter())
        .enumerate()
        .map(|(row, pair)| match pair {
            (Some(src), Some(tgt)) => Ok(SentencePair {
                src: src.to_string(),
                tgt: tgt.to_string(),
            }),
            _ => Err(anyhow!("row {row} has a null sentence")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_locations_split_into_repo_and_file() {
        assert_eq!(
            parse_hub_location("hf://wmt/wmt14/de-en/train.parquet"),
            Some(("wmt/wmt14".to_string(), "de-en/train.parquet".to_string()))
        );
        assert_eq!(parse_hub_location("hf://wmt/wmt14"), None);
        assert_eq!(parse_hub_location("data/train.tsv"), None);
    }

    #[test]
    fn local_paths_resolve_to_themselves() {
        assert_eq!(resolve("data/train.tsv").unwrap(), PathBuf::from("data/train.tsv"));
    }

    #[test]
    fn tsv_skips_blank_lines() {
        let text = "hello world\tbonjour monde\r\n\n  \nbye\tau revoir\n";
        let pairs = read_tsv(text.as_bytes(), "mem").unwrap();

        assert_eq!(
            pairs,
            vec![
                SentencePair {
                    src: "hello world".into(),
                    tgt: "bonjour monde".into()
                },
                SentencePair {
                    src: "bye".into(),
                    tgt: "au revoir".into()
                },
            ]
        );
    }

    #[test]
    fn tsv_line_without_tab_names_the_line() {
        let err = read_tsv("a\tb\nno tab here\n".as_bytes(), "train.tsv").unwrap_err();

        assert!(err.to_string().contains("train.tsv:2"), "{err}");
    }

    #[test]
    fn dataframe_columns_become_pairs() {
        let df = df!(
            "src" => ["hello", "bye"],
            "tgt" => ["bonjour", "au revoir"],
        )
        .unwrap();

        let pairs = string_pairs(&df, "src", "tgt").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].tgt, "au revoir");
    }

    #[test]
    fn missing_column_is_an_error() {
        let df = df!("src" => ["hello"]).unwrap();

        assert!(string_pairs(&df, "src", "tgt").is_err());
    }

    #[test]
    fn parquet_files_are_read_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.parquet");
        let mut df = df!(
            "en" => ["hello"],
            "fr" => ["bonjour"],
        )
        .unwrap();
        ParquetWriter::new(File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let pairs = read_pairs(&path, "en", "fr").unwrap();
        assert_eq!(
            pairs,
            vec![SentencePair {
                src: "hello".into(),
                tgt: "bonjour".into()
            }]
        );
    }
}

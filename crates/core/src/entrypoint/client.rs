// Coral is an open source distributed map-reduce engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::config::ClientConfig;
use crate::dht::decode_value;
use crate::mapreduce::client;
use crate::mapreduce::kernel::{WORD_COUNT_MAP, WORD_COUNT_REDUCE};
use crate::mapreduce::{Error, FnRef, JobOutcome};
use crate::Result;

const EXAMPLE_DATA: [&str; 4] = [
    "Hello MapReduce World",
    "This is a MapReduce example",
    "MapReduce is powerful and distributed",
    "Hello again distributed world",
];

fn load_data(config: &ClientConfig) -> Result<Vec<String>> {
    match &config.data_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(raw
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect())
        }
        None => {
            println!("no input file given; using the built-in example corpus");
            Ok(EXAMPLE_DATA.iter().map(|s| s.to_string()).collect())
        }
    }
}

pub fn run(config: ClientConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let data = load_data(&config)?;
        println!("submitting {} records", data.len());

        let submission = client::submit(
            &config,
            data,
            FnRef::new(WORD_COUNT_MAP),
            FnRef::new(WORD_COUNT_REDUCE),
        )
        .await?;

        println!("job accepted; awaiting results...");

        match submission.await_results().await? {
            JobOutcome::Completed(results) => {
                let mut counts: Vec<(String, u64)> = results
                    .iter()
                    .map(|(word, value)| Ok((word.clone(), decode_value(value)?)))
                    .collect::<Result<_>>()?;
                counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

                println!();
                println!("word count results");
                println!("{}", "-".repeat(40));
                for (word, count) in &counts {
                    println!("{word}: {count}");
                }
                println!("{}", "-".repeat(40));
                println!("total unique words: {}", counts.len());

                Ok(())
            }
            JobOutcome::Failed(reason) => Err(Error::JobFailed(reason).into()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_corpus_is_used_without_a_file() {
        let config = ClientConfig::default();
        let data = load_data(&config).unwrap();
        assert_eq!(data.len(), 4);
        assert!(data[0].contains("MapReduce"));
    }
}

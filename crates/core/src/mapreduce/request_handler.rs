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

use std::sync::Arc;

use crate::config::{
    MASTER_CLIENT_KEY, MASTER_DATA_KEY, MASTER_MAP_CODE_KEY, MASTER_REDUCE_CODE_KEY,
};
use crate::dht::{encode_value, ChordService};
use crate::distributed::member::Endpoint;

use super::{Error, FnRef};

/// Job intake. A submission is accepted by staging it into the DHT under the
/// well-known keys the master polls; one job at a time.
pub struct RequestHandler {
    kv: Arc<ChordService>,
}

impl RequestHandler {
    pub fn new(kv: Arc<ChordService>) -> Self {
        Self { kv }
    }

    pub async fn startup(
        &self,
        client: Endpoint,
        data: Vec<String>,
        map: FnRef,
        reduce: FnRef,
    ) -> Result<bool, Error> {
        match self.kv.lookup(MASTER_DATA_KEY).await {
            Ok(Some(_)) => return Err(Error::Busy),
            Ok(None) => {}
            Err(_) => return Err(Error::Unavailable),
        }

        tracing::info!(%client, records = data.len(), "accepted job submission");

        // the data key doubles as the busy flag, so it is staged last
        self.stage(MASTER_MAP_CODE_KEY, encode_value(&map)).await?;
        self.stage(MASTER_REDUCE_CODE_KEY, encode_value(&reduce))
            .await?;
        self.stage(MASTER_CLIENT_KEY, encode_value(&client)).await?;
        self.stage(MASTER_DATA_KEY, encode_value(&data)).await?;

        Ok(true)
    }

    async fn stage(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.kv
            .insert(key, value)
            .await
            .map_err(|_| Error::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::dht::{ChordNode, RingConfig};
    use crate::mapreduce::kernel::{WORD_COUNT_MAP, WORD_COUNT_REDUCE};
    use std::time::Duration;

    fn test_handler() -> RequestHandler {
        let endpoint = Endpoint::new("chord.dht", "127.0.0.1:7300".parse().unwrap());
        let node = Arc::new(ChordNode::new(
            endpoint,
            RingConfig {
                replication: 3,
                finger_table_size: 80,
                net: NetConfig {
                    request_timeout: Duration::from_millis(50),
                    request_retries: 2,
                },
            },
        ));

        RequestHandler::new(Arc::new(ChordService::new(node)))
    }

    fn client() -> Endpoint {
        Endpoint::new("client", "127.0.0.1:9100".parse().unwrap())
    }

    #[tokio::test]
    async fn second_submission_is_rejected_while_busy() {
        let handler = test_handler();
        let data = vec!["Hello MapReduce World".to_string()];

        let accepted = handler
            .startup(
                client(),
                data.clone(),
                FnRef::new(WORD_COUNT_MAP),
                FnRef::new(WORD_COUNT_REDUCE),
            )
            .await
            .unwrap();
        assert!(accepted);

        let second = handler
            .startup(
                client(),
                data,
                FnRef::new(WORD_COUNT_MAP),
                FnRef::new(WORD_COUNT_REDUCE),
            )
            .await;
        assert!(matches!(second, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn submission_stages_all_job_keys() {
        let handler = test_handler();

        handler
            .startup(
                client(),
                vec!["line".to_string()],
                FnRef::new(WORD_COUNT_MAP),
                FnRef::new(WORD_COUNT_REDUCE),
            )
            .await
            .unwrap();

        for key in [
            MASTER_DATA_KEY,
            MASTER_MAP_CODE_KEY,
            MASTER_REDUCE_CODE_KEY,
            MASTER_CLIENT_KEY,
        ] {
            assert!(handler.kv.lookup(key).await.unwrap().is_some(), "{key}");
        }
    }
}

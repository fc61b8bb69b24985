//! Property-based tests running whole transactions against the in-memory server.

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use rgraph_client::{ResourceId, ResourceType, TxOptions};

use crate::harness::TestEnv;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn kv_ops() -> impl Strategy<Value = Vec<(String, Option<String>)>> {
    prop::collection::vec(
        ("[a-d]", prop::option::of("[a-z0-9]{0,8}")),
        1..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Pipelined sets and deletes in one transaction leave exactly the last
    /// write per key, listed in key order.
    #[test]
    fn prop_pipelined_kv_writes_apply_in_order(ops in kv_ops()) {
        let mut expected: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in &ops {
            match value {
                Some(v) => { expected.insert(key.clone(), v.clone()); }
                None => { expected.remove(key); }
            }
        }

        let listed = runtime().block_on(async {
            let env = TestEnv::new().await.unwrap();
            let ops = ops.clone();
            env.client
                .with_write_tx("prop-kv", TxOptions::default(), move |tx| {
                    let ops = ops.clone();
                    async move {
                        let root = tx.client_root();
                        let mut live: HashSet<String> = HashSet::new();
                        for (key, value) in ops {
                            match value {
                                Some(v) => {
                                    tx.set_kv(root, &key, v)?;
                                    live.insert(key);
                                }
                                // Deleting a missing key fails; only delete live ones.
                                None if live.remove(&key) => tx.delete_kv(root, &key)?,
                                None => {}
                            }
                        }
                        Ok(())
                    }
                })
                .await
                .unwrap();
            env.client
                .with_read_tx("prop-kv-read", |tx| async move {
                    tx.list_kv(tx.client_root()).await
                })
                .await
                .unwrap()
        });

        let got: Vec<(String, String)> = listed
            .into_iter()
            .map(|kv| (kv.key, String::from_utf8(kv.value.to_vec()).unwrap()))
            .collect();
        let want: Vec<(String, String)> = expected.into_iter().collect();
        prop_assert_eq!(got, want);
    }

    /// Resources created in one transaction get distinct local ids carrying
    /// the transaction's id, and distinct global ids after commit.
    #[test]
    fn prop_created_ids_are_unique(count in 1usize..40) {
        let (local_tx, locals, globals) = runtime().block_on(async {
            let env = TestEnv::new().await.unwrap();
            env.client
                .with_write_tx("prop-ids", TxOptions::default(), move |tx| async move {
                    let mut refs = Vec::new();
                    for _ in 0..count {
                        refs.push(tx.create_struct(ResourceType::new("Node", "1"), None)?);
                    }
                    tx.commit().await?;
                    let mut globals = Vec::new();
                    for r in &refs {
                        globals.push(r.global().await?);
                    }
                    let locals: Vec<ResourceId> = refs.iter().map(|r| r.local_id).collect();
                    Ok((tx.local_tx_id(), locals, globals))
                })
                .await
                .unwrap()
        });

        let unique_locals: HashSet<_> = locals.iter().collect();
        let unique_globals: HashSet<_> = globals.iter().collect();
        prop_assert_eq!(unique_locals.len(), count);
        prop_assert_eq!(unique_globals.len(), count);
        for id in &locals {
            prop_assert!(id.is_local());
            prop_assert_eq!(id.tx_id(), Some(local_tx));
        }
        for id in &globals {
            prop_assert!(id.is_global());
        }
    }
}

// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Paged list calls.
//!
//! Migration steps walk every object of a kind (all `Setting`s, all storage
//! pods); fetching them page by page keeps memory and API server load flat on
//! large clusters.

use crate::constants::KUBE_LIST_PAGE_SIZE;
use crate::reconcilers::retry::retry_api_call;
use anyhow::{Context as _, Result};
use kube::{api::ListParams, Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// List every object matching `list_params`, following continue tokens.
///
/// Each page is fetched with [`retry_api_call`], so transient failures do not
/// restart the walk from the first page.
///
/// # Example
///
/// ```no_run
/// use kube::{Api, Client, api::ListParams};
/// use k8s_openapi::api::core::v1::Pod;
/// use storage_upgrade::reconcilers::pagination::list_all_paginated;
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = Client::try_default().await?;
/// let api: Api<Pod> = Api::namespaced(client, "storage-system");
///
/// let pods = list_all_paginated(&api, ListParams::default().labels("app=csi-attacher")).await?;
/// println!("Found {} pods", pods.len());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if any page cannot be fetched.
pub async fn list_all_paginated<K>(api: &Api<K>, mut list_params: ListParams) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    list_params.limit = Some(KUBE_LIST_PAGE_SIZE);
    let kind = K::kind(&()).to_string();

    let mut all_items = Vec::new();
    let mut page_count = 0;

    loop {
        page_count += 1;
        let result = retry_api_call(|| api.list(&list_params), &format!("list {kind}"))
            .await
            .with_context(|| format!("cannot list {kind} (page {page_count})"))?;

        let item_count = result.items.len();
        all_items.extend(result.items);

        debug!(
            kind = %kind,
            page = page_count,
            items_in_page = item_count,
            total_items = all_items.len(),
            "Fetched page from Kubernetes API"
        );

        match result.metadata.continue_ {
            Some(token) if !token.is_empty() => list_params.continue_token = Some(token),
            _ => break,
        }
    }

    Ok(all_items)
}

#[cfg(test)]
#[path = "pagination_tests.rs"]
mod pagination_tests;

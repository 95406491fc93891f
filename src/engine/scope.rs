use super::bounded;
use crate::model::{DeviceRollup, RuleScope};
use crate::store::GroupDirectory;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Group membership for one tenant, cached for exactly one evaluation cycle.
///
/// A group whose lookup fails is remembered as failed for the rest of the
/// cycle, so one broken group costs a single timeout instead of one per device.
#[derive(Debug)]
pub struct GroupScopeResolver {
    tenant_id: Uuid,
    members: HashMap<i64, HashSet<Uuid>>,
    failed: HashSet<i64>,
}

impl GroupScopeResolver {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            members: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    pub fn begin_cycle(&mut self) {
        self.members.clear();
        self.failed.clear();
    }

    pub fn cached_groups(&self) -> usize {
        self.members.len()
    }

    pub async fn resolve(
        &mut self,
        groups: &dyn GroupDirectory,
        group_id: i64,
        timeout: Duration,
    ) -> Result<&HashSet<Uuid>> {
        if self.failed.contains(&group_id) {
            anyhow::bail!("group {group_id} lookup already failed this cycle");
        }
        if !self.members.contains_key(&group_id) {
            let tenant_id = self.tenant_id;
            match bounded(
                timeout,
                "group membership fetch",
                groups.fetch_group_members(tenant_id, group_id),
            )
            .await
            {
                Ok(members) => {
                    self.members.insert(group_id, members);
                }
                Err(err) => {
                    self.failed.insert(group_id);
                    return Err(err);
                }
            }
        }
        self.members
            .get(&group_id)
            .ok_or_else(|| anyhow::anyhow!("group {group_id} missing from cache"))
    }

    async fn is_member(
        &mut self,
        groups: &dyn GroupDirectory,
        group_id: i64,
        device_id: Uuid,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(self
            .resolve(groups, group_id, timeout)
            .await?
            .contains(&device_id))
    }

    /// True when the device satisfies every populated filter of `scope`:
    /// its site is listed, it belongs to at least one of `group_ids`, and it
    /// belongs to `single_device_group_id`.
    pub async fn in_scope(
        &mut self,
        groups: &dyn GroupDirectory,
        scope: &RuleScope,
        device: &DeviceRollup,
        timeout: Duration,
    ) -> Result<bool> {
        if scope.is_unscoped() {
            return Ok(true);
        }

        if !scope.site_ids.is_empty() {
            let Some(site_id) = device.site_id else {
                return Ok(false);
            };
            if !scope.site_ids.contains(&site_id) {
                return Ok(false);
            }
        }

        if let Some(group_id) = scope.single_device_group_id {
            if !self
                .is_member(groups, group_id, device.device_id, timeout)
                .await?
            {
                return Ok(false);
            }
        }

        if scope.group_ids.is_empty() {
            return Ok(true);
        }
        for group_id in &scope.group_ids {
            if self
                .is_member(groups, *group_id, device.device_id, timeout)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

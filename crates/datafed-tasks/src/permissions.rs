//! Permission checks consulted by the preprocessor and task initialization.
//!
//! [`PermissionOracle`] is the seam to the access-control engine. The
//! bundled [`AclOracle`] evaluates grants stored in the resource graph:
//! direct user ACLs, group ACLs, and inheritable grants collected from every
//! ancestor collection path. Topic-bearing collections grant
//! [`perm::PUBLIC`] to everyone.

use std::collections::HashSet;

use datafed_core::{perm, CollectionId, RepoId, SubjectId};

use crate::error::Result;
use crate::model::{Acl, Grantee, ItemRef, User};
use crate::store::Transaction;

/// Grants found on one item for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalPermissions {
    /// Permissions granted on the item itself.
    pub grant: u32,
    /// Permissions the item passes down to its members.
    pub inhgrant: u32,
    /// Permissions inherited from ancestor collections.
    pub inherited: u32,
}

/// Answers permission questions about the resource graph.
pub trait PermissionOracle: Send + Sync {
    /// Returns true when `client` administers an object with the given owner
    /// and creator.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn is_admin_of_object(
        &self,
        tx: &dyn Transaction,
        client: &User,
        owner: &SubjectId,
        creator: &SubjectId,
    ) -> Result<bool>;

    /// Returns true when `client` administers `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn is_repo_admin(&self, tx: &dyn Transaction, client: &User, repo: &RepoId) -> Result<bool>;

    /// Returns true when `client` owns `project` or is a global admin.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn is_project_admin(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool>;

    /// Returns true when `client` owns or co-administers `project`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn is_project_manager(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool>;

    /// Collects the grants `client` holds directly on `item`.
    ///
    /// With `inherit_until`, ancestor collections are searched as well until
    /// the inherited bits cover that mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn local_permissions(
        &self,
        tx: &dyn Transaction,
        client: &SubjectId,
        item: &ItemRef,
        inherit_until: Option<u32>,
    ) -> Result<LocalPermissions>;

    /// Returns true when `client` holds every bit of `requested` on `item`,
    /// counting grants inherited from ancestors. With `inherited`, the item's
    /// own inheritable grants count as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn has_permissions(
        &self,
        tx: &dyn Transaction,
        client: &User,
        item: &ItemRef,
        requested: u32,
        inherited: bool,
    ) -> Result<bool>;
}

/// ACL-based oracle over the resource graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct AclOracle;

impl AclOracle {
    /// Creates the oracle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn is_public(tx: &dyn Transaction, item: &ItemRef) -> Result<bool> {
        match item {
            ItemRef::Collection(id) => Ok(tx.collection(id)?.is_some_and(|c| c.is_public())),
            ItemRef::Record(_) => Ok(false),
        }
    }

    fn applies_to(tx: &dyn Transaction, acl: &Acl, client: &SubjectId) -> Result<bool> {
        match &acl.grantee {
            Grantee::User(user) => Ok(user == client),
            Grantee::Group(group) => Ok(tx
                .group(group)?
                .is_some_and(|g| g.members.contains(client))),
        }
    }

    /// Sums the grant and inheritable grant of every ACL matching `client`.
    fn acl_bits(tx: &dyn Transaction, client: &SubjectId, item: &ItemRef) -> Result<(u32, u32)> {
        let mut grant = 0;
        let mut inhgrant = 0;
        for acl in tx.acls(item)? {
            if Self::applies_to(tx, &acl, client)? {
                grant |= acl.grant;
                inhgrant |= acl.inhgrant;
            }
        }
        Ok((grant, inhgrant))
    }

    /// Breadth-first walk up every ancestor path, OR-ing inheritable grants
    /// until `until` is covered.
    fn inherited_bits(
        tx: &dyn Transaction,
        client: &SubjectId,
        item: &ItemRef,
        mut found: u32,
        until: u32,
    ) -> Result<u32> {
        let mut seen: HashSet<CollectionId> = HashSet::new();
        let mut frontier = vec![item.clone()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for child in &frontier {
                for parent in tx.parents(child)? {
                    if !seen.insert(parent.clone()) {
                        continue;
                    }
                    let parent_ref = ItemRef::Collection(parent.clone());
                    if Self::is_public(tx, &parent_ref)? {
                        found |= perm::PUBLIC;
                    }
                    let (_, inhgrant) = Self::acl_bits(tx, client, &parent_ref)?;
                    found |= inhgrant;
                    if perm::covers(found, until) {
                        return Ok(found);
                    }
                    next.push(parent_ref);
                }
            }
            frontier = next;
        }
        Ok(found)
    }
}

impl PermissionOracle for AclOracle {
    fn is_admin_of_object(
        &self,
        tx: &dyn Transaction,
        client: &User,
        owner: &SubjectId,
        creator: &SubjectId,
    ) -> Result<bool> {
        if client.is_admin || owner == &client.id || creator == &client.id {
            return Ok(true);
        }
        if owner.is_project() {
            return self.is_project_manager(tx, client, owner);
        }
        Ok(false)
    }

    fn is_repo_admin(&self, tx: &dyn Transaction, client: &User, repo: &RepoId) -> Result<bool> {
        if client.is_admin {
            return Ok(true);
        }
        Ok(tx.repo(repo)?.is_some_and(|r| r.admins.contains(&client.id)))
    }

    fn is_project_admin(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool> {
        if client.is_admin {
            return Ok(true);
        }
        Ok(tx.project(project)?.is_some_and(|p| p.owner == client.id))
    }

    fn is_project_manager(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool> {
        if client.is_admin {
            return Ok(true);
        }
        Ok(tx
            .project(project)?
            .is_some_and(|p| p.owner == client.id || p.admins.contains(&client.id)))
    }

    fn local_permissions(
        &self,
        tx: &dyn Transaction,
        client: &SubjectId,
        item: &ItemRef,
        inherit_until: Option<u32>,
    ) -> Result<LocalPermissions> {
        let mut local = LocalPermissions::default();
        if Self::is_public(tx, item)? {
            local.grant |= perm::PUBLIC;
            local.inhgrant |= perm::PUBLIC;
        }

        let (grant, inhgrant) = Self::acl_bits(tx, client, item)?;
        local.grant |= grant;
        local.inhgrant |= inhgrant;

        if let Some(until) = inherit_until {
            local.inherited = Self::inherited_bits(tx, client, item, 0, until)?;
        }
        Ok(local)
    }

    fn has_permissions(
        &self,
        tx: &dyn Transaction,
        client: &User,
        item: &ItemRef,
        requested: u32,
        inherited: bool,
    ) -> Result<bool> {
        let mut found = 0;
        if Self::is_public(tx, item)? {
            found |= perm::PUBLIC;
        }
        let (grant, inhgrant) = Self::acl_bits(tx, &client.id, item)?;
        found |= grant;
        if inherited {
            found |= inhgrant;
        }
        if perm::covers(found, requested) {
            return Ok(true);
        }

        let found = Self::inherited_bits(tx, &client.id, item, found, requested)?;
        Ok(perm::covers(found, requested))
    }
}

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Sequence name used to allocate contact identifiers.
pub const CONTACT_ID_SEQUENCE: &str = "contact_id";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("id generation error: {0}")]
    IdGeneration(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn new_primary(
        id: ContactId,
        email: Option<String>,
        phone_number: Option<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn new_secondary(
        id: ContactId,
        email: Option<String>,
        phone_number: Option<String>,
        primary: ContactId,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            email,
            phone_number,
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Id of the primary this record belongs to.
    ///
    /// A secondary without a link roots at itself so a damaged row still forms a cluster.
    #[must_use]
    pub fn cluster_root(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(primary)) => primary,
            _ => self.id,
        }
    }

    /// Validate one contact row before it is persisted.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when the id is not positive, both contact values are
    /// missing, or the precedence and link fields disagree.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.id.0 <= 0 {
            return Err(IdentityError::Validation("contact id MUST be positive".to_string()));
        }

        if self.email.is_none() && self.phone_number.is_none() {
            return Err(IdentityError::Validation(
                "contact MUST carry an email or a phone number".to_string(),
            ));
        }

        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(_)) => Err(IdentityError::Validation(
                "primary contact MUST NOT have a linked_id".to_string(),
            )),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Validation(
                "secondary contact MUST have a linked_id".to_string(),
            )),
            (LinkPrecedence::Secondary, Some(linked)) if linked == self.id => Err(
                IdentityError::Validation("contact MUST NOT link to itself".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Total creation order: `created_at` ascending, then `id` ascending.
#[must_use]
pub fn creation_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

/// A validated (email, phone) pair. At least one value is always present.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IdentityQuery {
    email: Option<String>,
    phone_number: Option<String>,
}

impl IdentityQuery {
    /// Build a query from already-normalized values. Empty strings count as absent.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither value is present.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self, IdentityError> {
        let email = email.filter(|value| !value.is_empty());
        let phone_number = phone_number.filter(|value| !value.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(
                "At least one of email or phoneNumber is required".to_string(),
            ));
        }
        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

/// Query surface the reconciliation pipeline runs against.
///
/// Every read excludes soft-deleted rows and returns contacts in [`creation_order`].
/// Implementations are expected to run all calls of one reconciliation inside a single
/// atomic unit.
pub trait ContactStore {
    /// Active contacts whose email or phone number equals one of the given values.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the lookup fails.
    fn find_active_matches(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError>;

    /// Active contacts whose id is a root or whose `linked_id` is a root.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the lookup fails.
    fn load_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::Store`] when the lookup fails.
    fn get_active_contact(&self, id: ContactId) -> Result<Option<Contact>, IdentityError>;

    /// Make `id` a primary with no link. Returns whether the row changed.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the update fails.
    fn promote_to_primary(&self, id: ContactId, at: OffsetDateTime)
        -> Result<bool, IdentityError>;

    /// Turn every primary among `roots` into a secondary of `canonical`.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the update fails.
    fn demote_primaries(
        &self,
        canonical: ContactId,
        roots: &[ContactId],
        at: OffsetDateTime,
    ) -> Result<usize, IdentityError>;

    /// Point every active contact linked to one of `roots` at `canonical`.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the update fails.
    fn repoint_secondaries(
        &self,
        canonical: ContactId,
        roots: &[ContactId],
        at: OffsetDateTime,
    ) -> Result<usize, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::Store`] when the insert fails.
    fn insert_contact(&self, contact: &Contact) -> Result<(), IdentityError>;
}

/// Source of unique, strictly increasing identifiers per sequence name.
pub trait IdGenerator {
    /// # Errors
    /// Returns [`IdentityError::IdGeneration`] when the sequence is unknown or unavailable.
    fn next(&self, sequence: &str) -> Result<i64, IdentityError>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClusterResolution {
    pub canonical: Contact,
    pub roots: Vec<ContactId>,
    pub members: Vec<Contact>,
}

impl ClusterResolution {
    /// Roots that will be folded into the canonical cluster.
    #[must_use]
    pub fn merged_roots(&self) -> Vec<ContactId> {
        self.roots.iter().copied().filter(|root| *root != self.canonical.id).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct NormalizationOutcome {
    pub promoted: bool,
    pub demoted: usize,
    pub repointed: usize,
}

impl NormalizationOutcome {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.promoted && self.demoted == 0 && self.repointed == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkViolation {
    pub contact_id: ContactId,
    pub reason: String,
}

/// Distinct cluster roots of the matched contacts, in first-seen order.
#[must_use]
pub fn cluster_roots(matches: &[Contact]) -> Vec<ContactId> {
    let mut seen = BTreeSet::new();
    matches.iter().map(Contact::cluster_root).filter(|root| seen.insert(*root)).collect()
}

/// Oldest primary among `members`, or the oldest member when no primary is present.
#[must_use]
pub fn select_canonical_primary(members: &[Contact]) -> Option<&Contact> {
    members
        .iter()
        .filter(|contact| contact.is_primary())
        .min_by(|lhs, rhs| creation_order(lhs, rhs))
        .or_else(|| members.iter().min_by(|lhs, rhs| creation_order(lhs, rhs)))
}

/// Expand matches to their full clusters and pick the canonical primary.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when the roots expand to no active contact, or any
/// store error raised by the lookup.
pub fn resolve_clusters<S>(
    store: &S,
    matches: &[Contact],
) -> Result<ClusterResolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let roots = cluster_roots(matches);
    let members = store.load_clusters(&roots)?;
    let canonical = select_canonical_primary(&members).cloned().ok_or_else(|| {
        IdentityError::Consistency(format!(
            "cluster expansion for roots {} returned no active contact",
            join_ids(&roots)
        ))
    })?;

    Ok(ClusterResolution { canonical, roots, members })
}

/// Collapse every resolved cluster into the canonical one.
///
/// # Errors
/// Returns any store error raised by the updates.
pub fn normalize_clusters<S>(
    store: &S,
    resolution: &ClusterResolution,
    at: OffsetDateTime,
) -> Result<NormalizationOutcome, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let canonical_id = resolution.canonical.id;
    let mut outcome = NormalizationOutcome {
        promoted: store.promote_to_primary(canonical_id, at)?,
        ..NormalizationOutcome::default()
    };

    let merged_roots = resolution.merged_roots();
    if merged_roots.is_empty() {
        return Ok(outcome);
    }

    outcome.demoted = store.demote_primaries(canonical_id, &merged_roots, at)?;
    outcome.repointed = store.repoint_secondaries(canonical_id, &merged_roots, at)?;
    Ok(outcome)
}

/// Whether the query carries an email or phone number the cluster does not know yet.
#[must_use]
pub fn has_new_information(query: &IdentityQuery, members: &[Contact]) -> bool {
    let known_email = |value: &str| members.iter().any(|c| c.email.as_deref() == Some(value));
    let known_phone =
        |value: &str| members.iter().any(|c| c.phone_number.as_deref() == Some(value));

    query.email().is_some_and(|value| !known_email(value))
        || query.phone_number().is_some_and(|value| !known_phone(value))
}

/// Assemble the identity view: primary values first, then distinct values in member order.
#[must_use]
pub fn build_identity_view(primary: &Contact, members: &[Contact]) -> IdentityView {
    let emails = distinct_in_order(
        std::iter::once(primary.email.as_deref())
            .chain(members.iter().map(|contact| contact.email.as_deref())),
    );
    let phone_numbers = distinct_in_order(
        std::iter::once(primary.phone_number.as_deref())
            .chain(members.iter().map(|contact| contact.phone_number.as_deref())),
    );
    let secondary_contact_ids = members
        .iter()
        .filter(|contact| {
            contact.link_precedence == LinkPrecedence::Secondary && contact.id != primary.id
        })
        .map(|contact| contact.id)
        .collect();

    IdentityView { primary_contact_id: primary.id, emails, phone_numbers, secondary_contact_ids }
}

fn distinct_in_order<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values.flatten().filter(|value| seen.insert(*value)).map(str::to_string).collect()
}

/// Run one full reconciliation for `query` against `store`.
///
/// The caller owns atomicity: every store call made here belongs to one request and must be
/// committed or discarded together.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when clusters cannot be resolved,
/// [`IdentityError::IdGeneration`] when a new id cannot be allocated, and
/// [`IdentityError::Store`] for any failed read or write.
pub fn reconcile<S, G>(
    store: &S,
    ids: &G,
    query: &IdentityQuery,
    now: OffsetDateTime,
) -> Result<IdentityView, IdentityError>
where
    S: ContactStore + ?Sized,
    G: IdGenerator + ?Sized,
{
    let matches = store.find_active_matches(query.email(), query.phone_number())?;

    if matches.is_empty() {
        let contact = Contact::new_primary(
            allocate_contact_id(ids)?,
            query.email.clone(),
            query.phone_number.clone(),
            now,
        );
        contact.validate()?;
        store.insert_contact(&contact)?;
        tracing::info!(contact_id = %contact.id, "created primary contact");
        return Ok(build_identity_view(&contact, std::slice::from_ref(&contact)));
    }

    let resolution = resolve_clusters(store, &matches)?;
    let canonical_id = resolution.canonical.id;
    let outcome = normalize_clusters(store, &resolution, now)?;
    if !outcome.is_noop() {
        tracing::info!(
            primary_contact_id = %canonical_id,
            merged_roots = %join_ids(&resolution.merged_roots()),
            demoted = outcome.demoted,
            repointed = outcome.repointed,
            "merged contact clusters"
        );
    }

    let mut members = load_canonical_cluster(store, canonical_id)?;
    if has_new_information(query, &members) {
        let contact = Contact::new_secondary(
            allocate_contact_id(ids)?,
            query.email.clone(),
            query.phone_number.clone(),
            canonical_id,
            now,
        );
        contact.validate()?;
        store.insert_contact(&contact)?;
        tracing::info!(
            contact_id = %contact.id,
            primary_contact_id = %canonical_id,
            "created secondary contact"
        );
        members = load_canonical_cluster(store, canonical_id)?;
    } else {
        tracing::debug!(primary_contact_id = %canonical_id, "request carried no new information");
    }

    let primary = canonical_member(&members, canonical_id)?;
    Ok(build_identity_view(primary, &members))
}

/// Read-only cluster view for the cluster `id` belongs to.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when the cluster has no resolvable primary, or any
/// store error raised by the lookups.
pub fn lookup_cluster<S>(store: &S, id: ContactId) -> Result<Option<IdentityView>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let Some(contact) = store.get_active_contact(id)? else {
        return Ok(None);
    };

    let root = contact.cluster_root();
    let members = store.load_clusters(&[root])?;
    let primary = members
        .iter()
        .find(|member| member.id == root && member.is_primary())
        .or_else(|| select_canonical_primary(&members))
        .ok_or_else(|| {
            IdentityError::Consistency(format!("cluster rooted at {root} has no active members"))
        })?;

    Ok(Some(build_identity_view(primary, &members)))
}

/// Invariant violations across a full set of contacts.
#[must_use]
pub fn link_violations(contacts: &[Contact]) -> Vec<LinkViolation> {
    let lookup = |id: ContactId| contacts.iter().find(|contact| contact.id == id);
    let mut violations = Vec::new();

    for contact in contacts.iter().filter(|contact| !contact.is_deleted()) {
        let reason = match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, Some(linked)) => {
                Some(format!("primary contact links to {linked}"))
            }
            (LinkPrecedence::Secondary, None) => Some("secondary contact has no link".to_string()),
            (LinkPrecedence::Secondary, Some(linked)) => match lookup(linked) {
                None => Some(format!("secondary contact links to missing contact {linked}")),
                Some(target) if target.is_deleted() => {
                    Some(format!("secondary contact links to deleted contact {linked}"))
                }
                Some(target) if !target.is_primary() => {
                    Some(format!("secondary contact links to secondary contact {linked}"))
                }
                Some(_) => None,
            },
            (LinkPrecedence::Primary, None) => None,
        };

        if let Some(reason) = reason {
            violations.push(LinkViolation { contact_id: contact.id, reason });
        }
    }

    violations
}

fn allocate_contact_id<G>(ids: &G) -> Result<ContactId, IdentityError>
where
    G: IdGenerator + ?Sized,
{
    let raw = ids.next(CONTACT_ID_SEQUENCE)?;
    if raw <= 0 {
        return Err(IdentityError::IdGeneration(format!(
            "sequence {CONTACT_ID_SEQUENCE} returned non-positive value {raw}"
        )));
    }
    Ok(ContactId(raw))
}

fn load_canonical_cluster<S>(
    store: &S,
    canonical_id: ContactId,
) -> Result<Vec<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let members = store.load_clusters(&[canonical_id])?;
    if members.is_empty() {
        return Err(IdentityError::Consistency(format!(
            "canonical contact {canonical_id} vanished during reconciliation"
        )));
    }
    Ok(members)
}

fn canonical_member(
    members: &[Contact],
    canonical_id: ContactId,
) -> Result<&Contact, IdentityError> {
    members.iter().find(|member| member.id == canonical_id).ok_or_else(|| {
        IdentityError::Consistency(format!(
            "canonical contact {canonical_id} is missing from its own cluster"
        ))
    })
}

fn join_ids(ids: &[ContactId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time(offset_seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds)
    }

    #[derive(Debug, Default)]
    struct MemoryStore {
        contacts: RefCell<Vec<Contact>>,
        reads: Cell<usize>,
    }

    impl MemoryStore {
        fn with_contacts(contacts: Vec<Contact>) -> Self {
            Self { contacts: RefCell::new(contacts), reads: Cell::new(0) }
        }

        fn snapshot(&self) -> Vec<Contact> {
            self.contacts.borrow().clone()
        }

        fn contact(&self, id: i64) -> Contact {
            self.contacts
                .borrow()
                .iter()
                .find(|contact| contact.id == ContactId(id))
                .cloned()
                .unwrap_or_else(|| panic!("fixture contact {id} is missing"))
        }

        fn select(&self, predicate: impl Fn(&Contact) -> bool) -> Vec<Contact> {
            self.reads.set(self.reads.get() + 1);
            let mut selected = self
                .contacts
                .borrow()
                .iter()
                .filter(|contact| !contact.is_deleted() && predicate(contact))
                .cloned()
                .collect::<Vec<_>>();
            selected.sort_by(creation_order);
            selected
        }

        fn update(
            &self,
            predicate: impl Fn(&Contact) -> bool,
            apply: impl Fn(&mut Contact),
        ) -> usize {
            let mut changed = 0;
            for contact in self.contacts.borrow_mut().iter_mut() {
                if !contact.is_deleted() && predicate(contact) {
                    apply(contact);
                    changed += 1;
                }
            }
            changed
        }
    }

    impl ContactStore for MemoryStore {
        fn find_active_matches(
            &self,
            email: Option<&str>,
            phone_number: Option<&str>,
        ) -> Result<Vec<Contact>, IdentityError> {
            Ok(self.select(|contact| {
                (email.is_some() && contact.email.as_deref() == email)
                    || (phone_number.is_some() && contact.phone_number.as_deref() == phone_number)
            }))
        }

        fn load_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, IdentityError> {
            Ok(self.select(|contact| {
                roots.contains(&contact.id)
                    || contact.linked_id.is_some_and(|linked| roots.contains(&linked))
            }))
        }

        fn get_active_contact(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
            Ok(self.select(|contact| contact.id == id).into_iter().next())
        }

        fn promote_to_primary(
            &self,
            id: ContactId,
            at: OffsetDateTime,
        ) -> Result<bool, IdentityError> {
            let changed = self.update(
                |contact| {
                    contact.id == id && (!contact.is_primary() || contact.linked_id.is_some())
                },
                |contact| {
                    contact.link_precedence = LinkPrecedence::Primary;
                    contact.linked_id = None;
                    contact.updated_at = at;
                },
            );
            Ok(changed > 0)
        }

        fn demote_primaries(
            &self,
            canonical: ContactId,
            roots: &[ContactId],
            at: OffsetDateTime,
        ) -> Result<usize, IdentityError> {
            Ok(self.update(
                |contact| {
                    contact.id != canonical && roots.contains(&contact.id) && contact.is_primary()
                },
                |contact| {
                    contact.link_precedence = LinkPrecedence::Secondary;
                    contact.linked_id = Some(canonical);
                    contact.updated_at = at;
                },
            ))
        }

        fn repoint_secondaries(
            &self,
            canonical: ContactId,
            roots: &[ContactId],
            at: OffsetDateTime,
        ) -> Result<usize, IdentityError> {
            Ok(self.update(
                |contact| {
                    contact
                        .linked_id
                        .is_some_and(|linked| linked != canonical && roots.contains(&linked))
                },
                |contact| {
                    contact.linked_id = Some(canonical);
                    contact.updated_at = at;
                },
            ))
        }

        fn insert_contact(&self, contact: &Contact) -> Result<(), IdentityError> {
            self.contacts.borrow_mut().push(contact.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct CounterIds {
        next: Cell<i64>,
    }

    impl CounterIds {
        fn starting_at(value: i64) -> Self {
            Self { next: Cell::new(value) }
        }
    }

    impl IdGenerator for CounterIds {
        fn next(&self, sequence: &str) -> Result<i64, IdentityError> {
            if sequence != CONTACT_ID_SEQUENCE {
                return Err(IdentityError::IdGeneration(format!("unknown sequence {sequence}")));
            }
            let value = self.next.get();
            self.next.set(value + 1);
            Ok(value)
        }
    }

    struct UnavailableIds;

    impl IdGenerator for UnavailableIds {
        fn next(&self, _sequence: &str) -> Result<i64, IdentityError> {
            Err(IdentityError::IdGeneration("allocator unavailable".to_string()))
        }
    }

    fn query(email: Option<&str>, phone: Option<&str>) -> IdentityQuery {
        IdentityQuery::new(email.map(str::to_string), phone.map(str::to_string))
            .unwrap_or_else(|err| panic!("invalid fixture query: {err}"))
    }

    fn run(
        store: &MemoryStore,
        ids: &CounterIds,
        email: Option<&str>,
        phone: Option<&str>,
        offset_seconds: i64,
    ) -> IdentityView {
        reconcile(store, ids, &query(email, phone), fixture_time(offset_seconds))
            .unwrap_or_else(|err| panic!("reconcile failed: {err}"))
    }

    fn primary(id: i64, email: &str, phone: &str, offset_seconds: i64) -> Contact {
        Contact::new_primary(
            ContactId(id),
            Some(email.to_string()),
            Some(phone.to_string()),
            fixture_time(offset_seconds),
        )
    }

    fn secondary(id: i64, email: &str, phone: &str, linked: i64, offset_seconds: i64) -> Contact {
        Contact::new_secondary(
            ContactId(id),
            Some(email.to_string()),
            Some(phone.to_string()),
            ContactId(linked),
            fixture_time(offset_seconds),
        )
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    fn ids(values: &[i64]) -> Vec<ContactId> {
        values.iter().copied().map(ContactId).collect()
    }

    #[test]
    fn empty_store_creates_single_primary() {
        let store = MemoryStore::default();
        let counter = CounterIds::starting_at(1);

        let view = run(&store, &counter, Some("a@x.com"), Some("123"), 0);

        assert_eq!(
            view,
            IdentityView {
                primary_contact_id: ContactId(1),
                emails: strings(&["a@x.com"]),
                phone_numbers: strings(&["123"]),
                secondary_contact_ids: Vec::new(),
            }
        );
        let contacts = store.snapshot();
        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].is_primary());
        assert_eq!(contacts[0].linked_id, None);
    }

    #[test]
    fn new_phone_for_known_email_creates_secondary() {
        let store = MemoryStore::default();
        let counter = CounterIds::starting_at(1);
        run(&store, &counter, Some("a@x.com"), Some("123"), 0);

        let view = run(&store, &counter, Some("a@x.com"), Some("999"), 10);

        assert_eq!(view.primary_contact_id, ContactId(1));
        assert_eq!(view.emails, strings(&["a@x.com"]));
        assert_eq!(view.phone_numbers, strings(&["123", "999"]));
        assert_eq!(view.secondary_contact_ids, ids(&[2]));

        let created = store.contact(2);
        assert_eq!(created.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(created.linked_id, Some(ContactId(1)));
        assert_eq!(created.email.as_deref(), Some("a@x.com"));
        assert_eq!(created.phone_number.as_deref(), Some("999"));
    }

    #[test]
    fn repeated_request_is_idempotent() {
        let store = MemoryStore::default();
        let counter = CounterIds::starting_at(1);
        run(&store, &counter, Some("a@x.com"), Some("123"), 0);
        let first = run(&store, &counter, Some("a@x.com"), Some("999"), 10);
        let before = store.snapshot();

        let second = run(&store, &counter, Some("a@x.com"), Some("999"), 20);

        assert_eq!(first, second);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn bridging_request_merges_into_older_primary() {
        let store = MemoryStore::with_contacts(vec![
            primary(1, "a@x.com", "111", 0),
            primary(3, "b@x.com", "222", 100),
        ]);
        let counter = CounterIds::starting_at(4);

        let view = run(&store, &counter, Some("a@x.com"), Some("222"), 200);

        assert_eq!(
            view,
            IdentityView {
                primary_contact_id: ContactId(1),
                emails: strings(&["a@x.com", "b@x.com"]),
                phone_numbers: strings(&["111", "222"]),
                secondary_contact_ids: ids(&[3]),
            }
        );
        let demoted = store.contact(3);
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(ContactId(1)));
        assert_eq!(demoted.updated_at, fixture_time(200));
        assert_eq!(store.snapshot().len(), 2, "a pure merge must not insert a record");
        assert!(link_violations(&store.snapshot()).is_empty());
    }

    #[test]
    fn merge_repoints_secondaries_of_demoted_primary() {
        let store = MemoryStore::with_contacts(vec![
            primary(1, "a@x.com", "111", 0),
            primary(2, "b@x.com", "222", 50),
            secondary(3, "b2@x.com", "222", 2, 60),
        ]);
        let counter = CounterIds::starting_at(4);

        // Matches the secondary by email; its cluster root (2) must still be merged.
        let view = run(&store, &counter, Some("b2@x.com"), Some("111"), 100);

        assert_eq!(view.primary_contact_id, ContactId(1));
        assert_eq!(view.secondary_contact_ids, ids(&[2, 3]));
        assert_eq!(view.emails, strings(&["a@x.com", "b@x.com", "b2@x.com"]));
        assert_eq!(store.contact(3).linked_id, Some(ContactId(1)));
        assert_eq!(store.contact(2).linked_id, Some(ContactId(1)));
        assert!(link_violations(&store.snapshot()).is_empty());
    }

    #[test]
    fn newer_primary_matched_first_still_loses_to_older_primary() {
        let store = MemoryStore::with_contacts(vec![
            primary(7, "new@x.com", "700", 500),
            primary(9, "old@x.com", "900", 10),
        ]);
        let counter = CounterIds::starting_at(10);

        let view = run(&store, &counter, Some("new@x.com"), Some("900"), 600);

        assert_eq!(view.primary_contact_id, ContactId(9));
        assert_eq!(view.emails, strings(&["old@x.com", "new@x.com"]));
        assert_eq!(view.phone_numbers, strings(&["900", "700"]));
        assert_eq!(store.contact(7).linked_id, Some(ContactId(9)));
    }

    #[test]
    fn phone_only_request_matches_by_phone() {
        let store = MemoryStore::with_contacts(vec![primary(1, "a@x.com", "111", 0)]);
        let counter = CounterIds::starting_at(2);

        let view = run(&store, &counter, None, Some("111"), 10);

        assert_eq!(view.primary_contact_id, ContactId(1));
        assert_eq!(view.emails, strings(&["a@x.com"]));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn single_new_value_with_absent_other_creates_secondary_without_email() {
        let store = MemoryStore::with_contacts(vec![primary(1, "a@x.com", "111", 0)]);
        let counter = CounterIds::starting_at(2);
        run(&store, &counter, Some("a@x.com"), Some("222"), 10);

        let view = run(&store, &counter, None, Some("222"), 20);

        assert_eq!(view.secondary_contact_ids, ids(&[2]));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn soft_deleted_contacts_never_match() {
        let mut deleted = primary(1, "a@x.com", "111", 0);
        deleted.deleted_at = Some(fixture_time(5));
        let store = MemoryStore::with_contacts(vec![deleted]);
        let counter = CounterIds::starting_at(2);

        let view = run(&store, &counter, Some("a@x.com"), Some("111"), 10);

        assert_eq!(view.primary_contact_id, ContactId(2));
        assert!(view.secondary_contact_ids.is_empty());
        assert_eq!(store.contact(1).link_precedence, LinkPrecedence::Primary);
    }

    #[test]
    fn query_rejects_missing_and_empty_values() {
        for (email, phone) in [(None, None), (Some(String::new()), Some(String::new()))] {
            let Err(err) = IdentityQuery::new(email, phone) else {
                panic!("query without values must be rejected");
            };
            assert!(matches!(err, IdentityError::Validation(_)));
        }

        let only_phone = IdentityQuery::new(Some(String::new()), Some("123".to_string()))
            .unwrap_or_else(|err| panic!("phone-only query must be accepted: {err}"));
        assert_eq!(only_phone.email(), None);
        assert_eq!(only_phone.phone_number(), Some("123"));
    }

    #[test]
    fn id_generation_failure_aborts_without_insert() {
        let store = MemoryStore::default();

        let result =
            reconcile(&store, &UnavailableIds, &query(Some("a@x.com"), None), fixture_time(0));

        assert!(matches!(result, Err(IdentityError::IdGeneration(_))));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn non_positive_ids_are_rejected() {
        let store = MemoryStore::default();
        let counter = CounterIds::starting_at(0);

        let result = reconcile(&store, &counter, &query(Some("a@x.com"), None), fixture_time(0));

        assert!(matches!(result, Err(IdentityError::IdGeneration(_))));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn canonical_tie_break_prefers_smallest_id() {
        let members = vec![primary(5, "e@x.com", "5", 0), primary(4, "d@x.com", "4", 0)];

        let canonical = select_canonical_primary(&members);

        assert_eq!(canonical.map(|contact| contact.id), Some(ContactId(4)));
    }

    #[test]
    fn canonical_falls_back_to_oldest_member_without_primary() {
        let members =
            vec![secondary(8, "h@x.com", "8", 2, 30), secondary(6, "f@x.com", "6", 2, 20)];

        let canonical = select_canonical_primary(&members);

        assert_eq!(canonical.map(|contact| contact.id), Some(ContactId(6)));
        assert_eq!(select_canonical_primary(&[]), None);
    }

    #[test]
    fn empty_cluster_expansion_is_a_consistency_error() {
        // The match points at a primary that no longer resolves to any active row.
        let mut orphan = secondary(2, "b@x.com", "222", 1, 10);
        orphan.deleted_at = Some(fixture_time(20));
        let store = MemoryStore::default();

        let result = resolve_clusters(&store, &[orphan]);

        assert!(matches!(result, Err(IdentityError::Consistency(_))));
    }

    #[test]
    fn cluster_roots_deduplicate_in_first_seen_order() {
        let matches = vec![
            secondary(4, "d@x.com", "4", 3, 40),
            primary(1, "a@x.com", "1", 0),
            primary(3, "c@x.com", "3", 30),
        ];

        assert_eq!(cluster_roots(&matches), ids(&[3, 1]));
    }

    #[test]
    fn identity_view_puts_primary_values_first_and_skips_absent() {
        let mut later_primary = primary(9, "z@x.com", "900", 90);
        later_primary.phone_number = None;
        let members = vec![
            secondary(2, "a@x.com", "100", 9, 10),
            Contact::new_secondary(
                ContactId(3),
                None,
                Some("100".to_string()),
                ContactId(9),
                fixture_time(20),
            ),
            later_primary.clone(),
        ];

        let view = build_identity_view(&later_primary, &members);

        assert_eq!(view.emails, strings(&["z@x.com", "a@x.com"]));
        assert_eq!(view.phone_numbers, strings(&["100"]));
        assert_eq!(view.secondary_contact_ids, ids(&[2, 3]));
    }

    #[test]
    fn identity_view_serializes_with_camel_case_keys() {
        let contact = primary(1, "a@x.com", "123", 0);
        let view = build_identity_view(&contact, std::slice::from_ref(&contact));

        let value = serde_json::to_value(&view)
            .unwrap_or_else(|err| panic!("view must serialize: {err}"));

        assert_eq!(
            value,
            serde_json::json!({
                "primaryContactId": 1,
                "emails": ["a@x.com"],
                "phoneNumbers": ["123"],
                "secondaryContactIds": []
            })
        );
    }

    #[test]
    fn lookup_cluster_resolves_from_secondary() {
        let store = MemoryStore::with_contacts(vec![
            primary(1, "a@x.com", "111", 0),
            secondary(2, "b@x.com", "111", 1, 10),
        ]);

        let view = lookup_cluster(&store, ContactId(2))
            .unwrap_or_else(|err| panic!("lookup failed: {err}"))
            .unwrap_or_else(|| panic!("cluster must exist"));

        assert_eq!(view.primary_contact_id, ContactId(1));
        assert_eq!(view.secondary_contact_ids, ids(&[2]));
        assert_eq!(lookup_cluster(&store, ContactId(42)), Ok(None));
    }

    #[test]
    fn lookup_cluster_with_deleted_root_never_lists_primary_as_secondary() {
        let mut deleted_root = primary(1, "a@x.com", "111", 0);
        deleted_root.deleted_at = Some(fixture_time(5));
        let store = MemoryStore::with_contacts(vec![
            deleted_root,
            secondary(2, "b@x.com", "111", 1, 10),
            secondary(3, "c@x.com", "111", 1, 20),
        ]);

        let view = lookup_cluster(&store, ContactId(3))
            .unwrap_or_else(|err| panic!("lookup failed: {err}"))
            .unwrap_or_else(|| panic!("cluster must exist"));

        assert_eq!(view.primary_contact_id, ContactId(2));
        assert_eq!(view.secondary_contact_ids, ids(&[3]));
        assert_eq!(view.emails, strings(&["b@x.com", "c@x.com"]));
    }

    #[test]
    fn validate_rejects_inconsistent_links() {
        let mut linked_primary = primary(1, "a@x.com", "1", 0);
        linked_primary.linked_id = Some(ContactId(2));
        let mut unlinked_secondary = secondary(2, "b@x.com", "2", 1, 0);
        unlinked_secondary.linked_id = None;
        let self_linked = secondary(3, "c@x.com", "3", 3, 0);
        let empty = Contact::new_primary(ContactId(4), None, None, fixture_time(0));

        for contact in [linked_primary, unlinked_secondary, self_linked, empty] {
            assert!(matches!(contact.validate(), Err(IdentityError::Validation(_))));
        }
    }

    #[test]
    fn link_violations_report_broken_rows() {
        let mut deleted = primary(1, "a@x.com", "1", 0);
        deleted.deleted_at = Some(fixture_time(1));
        let contacts = vec![
            deleted,
            secondary(2, "b@x.com", "2", 1, 10),
            secondary(3, "c@x.com", "3", 2, 20),
            secondary(4, "d@x.com", "4", 99, 30),
        ];

        let violations = link_violations(&contacts);

        assert_eq!(
            violations.iter().map(|violation| violation.contact_id).collect::<Vec<_>>(),
            ids(&[2, 3, 4])
        );
    }

    fn arbitrary_request() -> impl Strategy<Value = (Option<u8>, Option<u8>)> {
        (proptest::option::of(0_u8..4), proptest::option::of(0_u8..4))
            .prop_filter("at least one value", |(email, phone)| email.is_some() || phone.is_some())
    }

    proptest! {
        #[test]
        fn property_reconcile_preserves_invariants_and_is_idempotent(
            requests in proptest::collection::vec(arbitrary_request(), 1..24)
        ) {
            let store = MemoryStore::default();
            let counter = CounterIds::starting_at(1);

            for (step, (email, phone)) in requests.iter().enumerate() {
                let email = email.map(|value| format!("user{value}@x.com"));
                let phone = phone.map(|value| format!("55500{value}"));
                let offset = i64::try_from(step).unwrap_or(i64::MAX);

                let view = run(&store, &counter, email.as_deref(), phone.as_deref(), offset);
                let contacts = store.snapshot();
                prop_assert!(link_violations(&contacts).is_empty());

                let unique_emails = view.emails.iter().collect::<BTreeSet<_>>();
                prop_assert_eq!(unique_emails.len(), view.emails.len());
                let unique_phones = view.phone_numbers.iter().collect::<BTreeSet<_>>();
                prop_assert_eq!(unique_phones.len(), view.phone_numbers.len());

                let primary = store.contact(view.primary_contact_id.0);
                prop_assert!(primary.is_primary());
                if let Some(primary_email) = &primary.email {
                    prop_assert_eq!(view.emails.first(), Some(primary_email));
                }
                if let Some(value) = &email {
                    prop_assert!(view.emails.contains(value));
                }
                if let Some(value) = &phone {
                    prop_assert!(view.phone_numbers.contains(value));
                }

                let repeated = run(&store, &counter, email.as_deref(), phone.as_deref(), offset);
                prop_assert_eq!(&repeated, &view);
                prop_assert_eq!(store.snapshot(), contacts);
            }
        }
    }
}

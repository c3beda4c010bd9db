use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store write conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal inconsistency: {0}")]
    Inconsistency(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
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

/// One stored contact row. A chain is one `Primary` record plus every
/// non-deleted `Secondary` whose `linked_id` names it; chains are flat, a
/// secondary never links to another secondary.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn creation_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

/// An incoming (email, phone) pair, normalized: values are trimmed and blank
/// strings collapse to `None` before any matching happens.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct IdentityFragment {
    email: Option<String>,
    phone_number: Option<String>,
}

impl IdentityFragment {
    #[must_use]
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Self {
        Self { email: normalize_value(email), phone_number: normalize_value(phone_number) }
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when neither contact field is present.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(KernelError::Validation(
                "at least one of email or phone number must be provided".to_string(),
            ));
        }
        Ok(())
    }
}

fn normalize_value(value: Option<String>) -> Option<String> {
    value.map(|raw| raw.trim().to_string()).filter(|trimmed| !trimmed.is_empty())
}

/// Consolidated view over one chain. `emails[0]` and `phone_numbers[0]` are
/// always the primary's own values when present; consumers rely on index 0
/// identifying the canonical value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Insert payload; the store assigns `id`, `created_at`, and `updated_at`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    #[must_use]
    pub fn primary(fragment: &IdentityFragment) -> Self {
        Self {
            email: fragment.email().map(str::to_string),
            phone_number: fragment.phone_number().map(str::to_string),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    #[must_use]
    pub fn secondary(fragment: &IdentityFragment, primary_id: ContactId) -> Self {
        Self {
            email: fragment.email().map(str::to_string),
            phone_number: fragment.phone_number().map(str::to_string),
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpdateMatch {
    /// Records whose `id` is in the set and whose precedence is still primary.
    PrimariesIn(Vec<ContactId>),
    /// Records whose `linked_id` is in the set.
    LinkedTo(Vec<ContactId>),
}

/// One entry of an atomic batch write. The store refreshes `updated_at` on
/// every matched row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContactUpdate {
    pub matcher: UpdateMatch,
    pub set_linked_id: Option<ContactId>,
    pub set_link_precedence: Option<LinkPrecedence>,
}

/// Narrow store boundary consumed by the reconciliation core. Implementations
/// must exclude soft-deleted rows from every read and apply `batch_update`
/// all-or-nothing.
pub trait ContactStore {
    /// Every non-deleted record whose email or phone equals the given values;
    /// a single indexed OR query. Result order is irrelevant.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store cannot be queried.
    fn find_matches(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError>;

    /// The record with `id = primary_id` plus every non-deleted record linked
    /// to it, ordered ascending by `(created_at, id)`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store cannot be queried.
    fn fetch_chain(&mut self, primary_id: ContactId) -> Result<Vec<ContactRecord>, StoreError>;

    /// The non-deleted record in `ids` with the smallest `(created_at, id)`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store cannot be queried.
    fn oldest_among(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Option<ContactRecord>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the row cannot be persisted.
    fn insert(&mut self, contact: NewContact) -> Result<ContactRecord, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when any update fails; no update may be applied
    /// partially.
    fn batch_update(&mut self, updates: &[ContactUpdate]) -> Result<(), StoreError>;
}

/// Maps matched records to the canonical primary ids of their chains: a
/// primary resolves to itself, a secondary to its `linked_id`.
///
/// # Errors
/// Returns [`KernelError::Inconsistency`] for a secondary without a linked
/// primary; that shape must never exist in a healthy store.
pub fn resolve_to_primaries(
    matches: &[ContactRecord],
) -> Result<BTreeSet<ContactId>, KernelError> {
    let mut primaries = BTreeSet::new();
    for record in matches {
        match record.link_precedence {
            LinkPrecedence::Primary => {
                primaries.insert(record.id);
            }
            LinkPrecedence::Secondary => match record.linked_id {
                Some(primary_id) => {
                    primaries.insert(primary_id);
                }
                None => {
                    return Err(KernelError::Inconsistency(format!(
                        "secondary contact {} has no linked primary",
                        record.id
                    )));
                }
            },
        }
    }
    Ok(primaries)
}

/// True iff the fragment carries an email or phone value absent from every
/// record of the chain. A fragment that only repeats known values is a no-op.
#[must_use]
pub fn has_new_information(chain: &[ContactRecord], fragment: &IdentityFragment) -> bool {
    if let Some(email) = fragment.email() {
        if !chain.iter().any(|record| record.email.as_deref() == Some(email)) {
            return true;
        }
    }
    if let Some(phone) = fragment.phone_number() {
        if !chain.iter().any(|record| record.phone_number.as_deref() == Some(phone)) {
            return true;
        }
    }
    false
}

/// Loads a chain and verifies it is anchored by a primary record with the
/// given id. A resolved id that names no primary is a resolver/store mismatch
/// and is never silently tolerated.
///
/// # Errors
/// Returns [`KernelError::Inconsistency`] when the anchor is missing, or a
/// [`StoreError`] from the store.
pub fn fetch_verified_chain(
    store: &mut dyn ContactStore,
    primary_id: ContactId,
) -> Result<Vec<ContactRecord>, KernelError> {
    let chain = store.fetch_chain(primary_id)?;
    let anchored = chain.iter().any(|record| record.id == primary_id && record.is_primary());
    if !anchored {
        return Err(KernelError::Inconsistency(format!(
            "contact {primary_id} does not name a primary record"
        )));
    }
    Ok(chain)
}

/// Assembles the consolidated view: primary values first, then every other
/// distinct value in first-encounter order (exact, case-sensitive dedup), and
/// secondary ids ascending by creation.
///
/// # Errors
/// Returns [`KernelError::Inconsistency`] unless the chain holds exactly one
/// primary record.
pub fn build_consolidated(chain: &[ContactRecord]) -> Result<ConsolidatedContact, KernelError> {
    let mut primaries = chain.iter().filter(|record| record.is_primary());
    let primary = primaries.next().ok_or_else(|| {
        KernelError::Inconsistency("chain has no primary contact".to_string())
    })?;
    if primaries.next().is_some() {
        return Err(KernelError::Inconsistency(format!(
            "chain anchored at contact {} holds more than one primary",
            primary.id
        )));
    }

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    if let Some(email) = &primary.email {
        emails.push(email.clone());
    }
    if let Some(phone) = &primary.phone_number {
        phone_numbers.push(phone.clone());
    }
    for record in chain {
        if let Some(email) = &record.email {
            if !emails.contains(email) {
                emails.push(email.clone());
            }
        }
        if let Some(phone) = &record.phone_number {
            if !phone_numbers.contains(phone) {
                phone_numbers.push(phone.clone());
            }
        }
    }

    let mut secondaries: Vec<&ContactRecord> =
        chain.iter().filter(|record| !record.is_primary()).collect();
    secondaries.sort_by_key(|record| record.creation_key());

    Ok(ConsolidatedContact {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondaries.iter().map(|record| record.id).collect(),
    })
}

/// The three reconciliation outcomes, decided once per request from the
/// number of distinct chains the fragment touched.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResolutionOutcome {
    CreateNew,
    ExtendChain(ContactId),
    MergeChains(BTreeSet<ContactId>),
}

impl ResolutionOutcome {
    #[must_use]
    pub fn classify(primaries: BTreeSet<ContactId>) -> Self {
        let mut ids = primaries.into_iter();
        match (ids.next(), ids.next()) {
            (None, _) => Self::CreateNew,
            (Some(id), None) => Self::ExtendChain(id),
            (Some(first), Some(second)) => {
                let mut set = BTreeSet::from([first, second]);
                set.extend(ids);
                Self::MergeChains(set)
            }
        }
    }
}

/// Consolidates two or more chains under their oldest primary.
///
/// All demotions and relinks go through one `batch_update` call so the store
/// can apply them atomically: every demoted primary flips to secondary under
/// the survivor, and every secondary of a demoted primary is repointed at the
/// survivor, keeping the merged chain flat. The fragment that triggered the
/// merge is appended as one more secondary iff it still carries new
/// information after the merge.
///
/// The candidate count generalizes uniformly: a single request touching N
/// previously independent chains consolidates all of them in this one pass.
///
/// # Errors
/// Returns [`KernelError::Inconsistency`] when fewer than two candidates are
/// supplied, when no candidate survives the lookup, or when the survivor is
/// not a primary record; these are fatal preconditions, not retryable states.
pub fn merge_chains(
    store: &mut dyn ContactStore,
    primary_ids: &BTreeSet<ContactId>,
    fragment: &IdentityFragment,
) -> Result<ConsolidatedContact, KernelError> {
    if primary_ids.len() < 2 {
        return Err(KernelError::Inconsistency(format!(
            "merge requires at least two candidate primaries, got {}",
            primary_ids.len()
        )));
    }

    let oldest = store
        .oldest_among(primary_ids)?
        .ok_or_else(|| KernelError::Inconsistency("no candidate primary found during merge".to_string()))?;
    if !oldest.is_primary() {
        return Err(KernelError::Inconsistency(format!(
            "merge candidate {} is not a primary record",
            oldest.id
        )));
    }

    let demoted: Vec<ContactId> =
        primary_ids.iter().copied().filter(|id| *id != oldest.id).collect();
    store.batch_update(&[
        ContactUpdate {
            matcher: UpdateMatch::PrimariesIn(demoted.clone()),
            set_linked_id: Some(oldest.id),
            set_link_precedence: Some(LinkPrecedence::Secondary),
        },
        ContactUpdate {
            matcher: UpdateMatch::LinkedTo(demoted),
            set_linked_id: Some(oldest.id),
            set_link_precedence: None,
        },
    ])?;

    let mut chain = fetch_verified_chain(store, oldest.id)?;
    if has_new_information(&chain, fragment) {
        let appended = store.insert(NewContact::secondary(fragment, oldest.id))?;
        chain.push(appended);
    }
    build_consolidated(&chain)
}

/// Reconciles one fragment against the store and returns the consolidated
/// view of the chain it resolved to.
///
/// Flow: match the fragment, resolve matches to canonical primaries, then
/// dispatch once on [`ResolutionOutcome`] — create a fresh primary when
/// nothing matched, extend the single matched chain (appending a secondary
/// only when the fragment adds information), or merge when the fragment
/// bridged several chains. The store round-trip count is bounded: one match
/// query plus at most a chain fetch, an oldest lookup, one batch write, and
/// one insert.
///
/// # Errors
/// Returns [`KernelError::Validation`] for an empty fragment,
/// [`KernelError::Inconsistency`] for fatal store-shape violations, and
/// [`KernelError::Store`] for propagated store failures.
pub fn reconcile(
    store: &mut dyn ContactStore,
    fragment: &IdentityFragment,
) -> Result<ConsolidatedContact, KernelError> {
    fragment.validate()?;

    let matches = store.find_matches(fragment.email(), fragment.phone_number())?;
    let primaries = resolve_to_primaries(&matches)?;

    match ResolutionOutcome::classify(primaries) {
        ResolutionOutcome::CreateNew => {
            let primary = store.insert(NewContact::primary(fragment))?;
            build_consolidated(&[primary])
        }
        ResolutionOutcome::ExtendChain(primary_id) => {
            let mut chain = fetch_verified_chain(store, primary_id)?;
            if has_new_information(&chain, fragment) {
                let appended = store.insert(NewContact::secondary(fragment, primary_id))?;
                chain.push(appended);
            }
            build_consolidated(&chain)
        }
        ResolutionOutcome::MergeChains(primary_ids) => merge_chains(store, &primary_ids, fragment),
    }
}

/// In-memory [`ContactStore`] keyed by id, with a logical clock so fixtures
/// get distinct, strictly increasing timestamps without touching wall time.
/// Requests against it are inherently serial (`&mut self`).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: BTreeMap<ContactId, ContactRecord>,
    next_id: i64,
    tick: i64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self { records: BTreeMap::new(), next_id: 1, tick: 0 }
    }

    fn now(&mut self) -> OffsetDateTime {
        self.tick += 1;
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(self.tick)
    }

    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<&ContactRecord> {
        self.records.get(&id)
    }

    #[must_use]
    pub fn records_snapshot(&self) -> Vec<ContactRecord> {
        self.records.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Marks a record deleted; it keeps its row but disappears from matching
    /// and chain assembly. Returns false when the id is unknown or already
    /// deleted.
    pub fn soft_delete(&mut self, id: ContactId) -> bool {
        let now = self.now();
        match self.records.get_mut(&id) {
            Some(record) if record.deleted_at.is_none() => {
                record.deleted_at = Some(now);
                record.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Inserts a record with an explicit `created_at`; fixture support for
    /// exercising creation-time ties.
    pub fn insert_backdated(
        &mut self,
        contact: NewContact,
        created_at: OffsetDateTime,
    ) -> ContactRecord {
        let id = ContactId(self.next_id);
        self.next_id += 1;
        let record = ContactRecord {
            id,
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        };
        self.records.insert(id, record.clone());
        record
    }
}

impl ContactStore for MemoryStore {
    fn find_matches(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self
            .records
            .values()
            .filter(|record| !record.is_deleted())
            .filter(|record| {
                let email_hit =
                    email.is_some_and(|value| record.email.as_deref() == Some(value));
                let phone_hit = phone_number
                    .is_some_and(|value| record.phone_number.as_deref() == Some(value));
                email_hit || phone_hit
            })
            .cloned()
            .collect())
    }

    fn fetch_chain(&mut self, primary_id: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        let mut chain: Vec<ContactRecord> = self
            .records
            .values()
            .filter(|record| !record.is_deleted())
            .filter(|record| record.id == primary_id || record.linked_id == Some(primary_id))
            .cloned()
            .collect();
        chain.sort_by_key(ContactRecord::creation_key);
        Ok(chain)
    }

    fn oldest_among(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Option<ContactRecord>, StoreError> {
        Ok(self
            .records
            .values()
            .filter(|record| !record.is_deleted() && ids.contains(&record.id))
            .min_by_key(|record| record.creation_key())
            .cloned())
    }

    fn insert(&mut self, contact: NewContact) -> Result<ContactRecord, StoreError> {
        let now = self.now();
        Ok(self.insert_backdated(contact, now))
    }

    fn batch_update(&mut self, updates: &[ContactUpdate]) -> Result<(), StoreError> {
        for update in updates {
            let now = self.now();
            let matched: Vec<ContactId> = match &update.matcher {
                UpdateMatch::PrimariesIn(ids) => self
                    .records
                    .values()
                    .filter(|record| ids.contains(&record.id) && record.is_primary())
                    .map(|record| record.id)
                    .collect(),
                UpdateMatch::LinkedTo(ids) => self
                    .records
                    .values()
                    .filter(|record| {
                        record.linked_id.is_some_and(|linked| ids.contains(&linked))
                    })
                    .map(|record| record.id)
                    .collect(),
            };
            for id in matched {
                if let Some(record) = self.records.get_mut(&id) {
                    if let Some(linked_id) = update.set_linked_id {
                        record.linked_id = Some(linked_id);
                    }
                    if let Some(precedence) = update.set_link_precedence {
                        record.link_precedence = precedence;
                    }
                    record.updated_at = now;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fragment(email: Option<&str>, phone_number: Option<&str>) -> IdentityFragment {
        IdentityFragment::new(email.map(str::to_string), phone_number.map(str::to_string))
    }

    fn run(
        store: &mut MemoryStore,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> ConsolidatedContact {
        match reconcile(store, &fragment(email, phone_number)) {
            Ok(view) => view,
            Err(err) => panic!("reconcile should succeed: {err}"),
        }
    }

    // Test IDs: TREC-001
    #[test]
    fn creates_new_primary_for_unknown_fragment() {
        let mut store = MemoryStore::new();
        let view = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));

        assert_eq!(view.emails, vec!["doc@hillvalley.edu".to_string()]);
        assert_eq!(view.phone_numbers, vec!["123456".to_string()]);
        assert!(view.secondary_contact_ids.is_empty());
        assert_eq!(store.len(), 1);
    }

    // Test IDs: TREC-002
    #[test]
    fn fragment_with_only_email_creates_primary() {
        let mut store = MemoryStore::new();
        let view = run(&mut store, Some("doc@hillvalley.edu"), None);

        assert_eq!(view.emails, vec!["doc@hillvalley.edu".to_string()]);
        assert!(view.phone_numbers.is_empty());
        assert!(view.secondary_contact_ids.is_empty());
    }

    // Test IDs: TREC-003
    #[test]
    fn fragment_with_only_phone_creates_primary() {
        let mut store = MemoryStore::new();
        let view = run(&mut store, None, Some("123456"));

        assert!(view.emails.is_empty());
        assert_eq!(view.phone_numbers, vec!["123456".to_string()]);
    }

    // Test IDs: TREC-004
    #[test]
    fn repeated_identical_fragment_returns_same_primary_without_new_records() {
        let mut store = MemoryStore::new();
        let first = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        let second = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));

        assert_eq!(first.primary_contact_id, second.primary_contact_id);
        assert!(second.secondary_contact_ids.is_empty());
        assert_eq!(store.len(), 1);
    }

    // Test IDs: TREC-005
    #[test]
    fn new_email_on_known_phone_appends_secondary() {
        let mut store = MemoryStore::new();
        let first = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        let second = run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));

        assert_eq!(second.primary_contact_id, first.primary_contact_id);
        assert_eq!(
            second.emails,
            vec!["doc@hillvalley.edu".to_string(), "mcfly@hillvalley.edu".to_string()]
        );
        assert_eq!(second.phone_numbers, vec!["123456".to_string()]);
        assert_eq!(second.secondary_contact_ids.len(), 1);
    }

    // Test IDs: TREC-006
    #[test]
    fn fragment_duplicating_chain_values_is_a_no_op() {
        let mut store = MemoryStore::new();
        run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));
        let before = store.len();

        // Both values already live in the chain, one per record.
        let view = run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));
        assert_eq!(store.len(), before);
        assert_eq!(view.secondary_contact_ids.len(), 1);
    }

    // Test IDs: TMRG-001
    #[test]
    fn merges_two_primaries_and_keeps_the_oldest() {
        let mut store = MemoryStore::new();
        let george = run(&mut store, Some("george@hillvalley.edu"), Some("919191"));
        let biff = run(&mut store, Some("biff@hillvalley.edu"), Some("717171"));
        assert_ne!(george.primary_contact_id, biff.primary_contact_id);

        let merged = run(&mut store, Some("george@hillvalley.edu"), Some("717171"));

        assert_eq!(merged.primary_contact_id, george.primary_contact_id);
        assert_eq!(
            merged.emails,
            vec!["george@hillvalley.edu".to_string(), "biff@hillvalley.edu".to_string()]
        );
        assert_eq!(merged.phone_numbers, vec!["919191".to_string(), "717171".to_string()]);
        assert_eq!(merged.secondary_contact_ids.len(), 1);
    }

    // Test IDs: TMRG-002
    #[test]
    fn consolidated_view_is_identical_for_email_only_phone_only_and_both() {
        let mut store = MemoryStore::new();
        run(&mut store, Some("george@hillvalley.edu"), Some("919191"));
        run(&mut store, Some("biff@hillvalley.edu"), Some("717171"));
        run(&mut store, Some("george@hillvalley.edu"), Some("717171"));

        let by_email = run(&mut store, Some("biff@hillvalley.edu"), None);
        let by_phone = run(&mut store, None, Some("919191"));
        let by_both = run(&mut store, Some("george@hillvalley.edu"), Some("717171"));

        assert_eq!(by_email, by_phone);
        assert_eq!(by_phone, by_both);
    }

    // Test IDs: TMRG-003
    #[test]
    fn merge_relinks_secondaries_of_demoted_primaries() {
        let mut store = MemoryStore::new();
        let left = run(&mut store, Some("doc@hillvalley.edu"), Some("111111"));
        run(&mut store, Some("doc-lab@hillvalley.edu"), Some("111111"));
        run(&mut store, Some("clara@hillvalley.edu"), Some("222222"));
        run(&mut store, Some("clara-home@hillvalley.edu"), Some("222222"));

        let merged = run(&mut store, Some("doc@hillvalley.edu"), Some("222222"));
        assert_eq!(merged.primary_contact_id, left.primary_contact_id);

        // Every surviving record is either the one primary or points at it.
        for record in store.records_snapshot() {
            if record.id == merged.primary_contact_id {
                assert!(record.is_primary());
                assert!(record.linked_id.is_none());
            } else {
                assert_eq!(record.link_precedence, LinkPrecedence::Secondary);
                assert_eq!(record.linked_id, Some(merged.primary_contact_id));
            }
        }
    }

    // Test IDs: TMRG-004
    #[test]
    fn merge_consolidates_three_chains_in_one_request() {
        // Duplicate primaries sharing an email can exist when requests raced;
        // a single fragment touching all of them must converge in one pass.
        let mut store = MemoryStore::new();
        let base = OffsetDateTime::UNIX_EPOCH;
        let oldest = store.insert_backdated(
            NewContact::primary(&fragment(Some("dup@hillvalley.edu"), Some("111"))),
            base + Duration::seconds(1),
        );
        let duplicate = store.insert_backdated(
            NewContact::primary(&fragment(Some("dup@hillvalley.edu"), Some("222"))),
            base + Duration::seconds(2),
        );
        let by_phone = store.insert_backdated(
            NewContact::primary(&fragment(None, Some("333"))),
            base + Duration::seconds(3),
        );

        let merged = run(&mut store, Some("dup@hillvalley.edu"), Some("333"));

        assert_eq!(merged.primary_contact_id, oldest.id);
        assert_eq!(merged.secondary_contact_ids, vec![duplicate.id, by_phone.id]);
        for phone in ["111", "222", "333"] {
            assert!(merged.phone_numbers.contains(&phone.to_string()));
        }
    }

    // Test IDs: TMRG-005
    #[test]
    fn chains_merge_transitively_across_requests() {
        let mut store = MemoryStore::new();
        let first = run(&mut store, Some("a@hillvalley.edu"), Some("100"));
        run(&mut store, Some("b@hillvalley.edu"), Some("200"));
        run(&mut store, Some("c@hillvalley.edu"), Some("300"));

        run(&mut store, Some("a@hillvalley.edu"), Some("200"));
        let merged = run(&mut store, Some("b@hillvalley.edu"), Some("300"));

        assert_eq!(merged.primary_contact_id, first.primary_contact_id);
        for email in ["a@hillvalley.edu", "b@hillvalley.edu", "c@hillvalley.edu"] {
            assert!(merged.emails.contains(&email.to_string()));
        }
        for phone in ["100", "200", "300"] {
            assert!(merged.phone_numbers.contains(&phone.to_string()));
        }
    }

    // Test IDs: TMRG-006
    #[test]
    fn equal_created_at_ties_break_on_smaller_id() {
        let mut store = MemoryStore::new();
        let epoch = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1);
        let first = store.insert_backdated(
            NewContact::primary(&fragment(Some("doc@hillvalley.edu"), None)),
            epoch,
        );
        let second = store.insert_backdated(
            NewContact::primary(&fragment(None, Some("123456"))),
            epoch,
        );
        assert!(first.id < second.id);

        let merged = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        assert_eq!(merged.primary_contact_id, first.id);
    }

    // Test IDs: TVIEW-001
    #[test]
    fn primary_values_lead_the_consolidated_view() {
        let mut store = MemoryStore::new();
        let first = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));
        let view = run(&mut store, Some("doc@hillvalley.edu"), Some("654321"));

        assert_eq!(view.primary_contact_id, first.primary_contact_id);
        assert_eq!(view.emails[0], "doc@hillvalley.edu");
        assert_eq!(view.phone_numbers[0], "123456");
    }

    // Test IDs: TVIEW-002
    #[test]
    fn consolidated_view_serializes_with_wire_field_names() {
        let view = ConsolidatedContact {
            primary_contact_id: ContactId(1),
            emails: vec!["doc@hillvalley.edu".to_string()],
            phone_numbers: vec!["123456".to_string()],
            secondary_contact_ids: vec![ContactId(2)],
        };
        let value = match serde_json::to_value(&view) {
            Ok(value) => value,
            Err(err) => panic!("serialization should succeed: {err}"),
        };

        assert_eq!(value.get("primaryContactId"), Some(&serde_json::json!(1)));
        assert_eq!(value.get("phoneNumbers"), Some(&serde_json::json!(["123456"])));
        assert_eq!(value.get("secondaryContactIds"), Some(&serde_json::json!([2])));
    }

    // Test IDs: TDEL-001
    #[test]
    fn soft_deleted_chain_is_invisible_to_matching() {
        let mut store = MemoryStore::new();
        let original = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        assert!(store.soft_delete(original.primary_contact_id));

        let fresh = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        assert_ne!(fresh.primary_contact_id, original.primary_contact_id);
        assert!(fresh.secondary_contact_ids.is_empty());
    }

    // Test IDs: TDEL-002
    #[test]
    fn orphaned_secondary_of_deleted_primary_is_not_promoted() {
        let mut store = MemoryStore::new();
        let chain = run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        let extended = run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));
        assert_eq!(extended.secondary_contact_ids.len(), 1);
        assert!(store.soft_delete(chain.primary_contact_id));

        // The orphan still matches, but its chain no longer resolves to a
        // primary; that surfaces as an inconsistency instead of a guess.
        let result = reconcile(&mut store, &fragment(Some("mcfly@hillvalley.edu"), None));
        assert!(matches!(result, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TVAL-001
    #[test]
    fn empty_fragment_is_rejected_before_touching_the_store() {
        let mut store = MemoryStore::new();
        let result = reconcile(&mut store, &fragment(None, None));
        assert!(matches!(result, Err(KernelError::Validation(_))));
        assert!(store.is_empty());
    }

    // Test IDs: TVAL-002
    #[test]
    fn blank_values_normalize_to_absent() {
        let blank = fragment(Some("   "), Some(""));
        assert!(blank.email().is_none());
        assert!(blank.phone_number().is_none());
        assert!(matches!(blank.validate(), Err(KernelError::Validation(_))));
    }

    // Test IDs: TVAL-003
    #[test]
    fn email_matching_is_case_sensitive() {
        let mut store = MemoryStore::new();
        let lower = run(&mut store, Some("doc@hillvalley.edu"), None);
        let upper = run(&mut store, Some("Doc@hillvalley.edu"), None);
        assert_ne!(lower.primary_contact_id, upper.primary_contact_id);
    }

    // Test IDs: TERR-001
    #[test]
    fn resolver_rejects_secondary_without_linked_primary() {
        let record = ContactRecord {
            id: ContactId(7),
            email: Some("doc@hillvalley.edu".to_string()),
            phone_number: None,
            linked_id: None,
            link_precedence: LinkPrecedence::Secondary,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            deleted_at: None,
        };
        let result = resolve_to_primaries(&[record]);
        assert!(matches!(result, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TERR-002
    #[test]
    fn chain_fetch_rejects_an_id_that_is_not_primary() {
        let mut store = MemoryStore::new();
        run(&mut store, Some("doc@hillvalley.edu"), Some("123456"));
        let extended = run(&mut store, Some("mcfly@hillvalley.edu"), Some("123456"));
        let secondary_id = extended.secondary_contact_ids[0];

        let result = fetch_verified_chain(&mut store, secondary_id);
        assert!(matches!(result, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TERR-003
    #[test]
    fn view_requires_exactly_one_primary() {
        let mk = |id: i64, precedence: LinkPrecedence| ContactRecord {
            id: ContactId(id),
            email: None,
            phone_number: Some("123456".to_string()),
            linked_id: (precedence == LinkPrecedence::Secondary).then_some(ContactId(1)),
            link_precedence: precedence,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            deleted_at: None,
        };

        let none = build_consolidated(&[mk(2, LinkPrecedence::Secondary)]);
        assert!(matches!(none, Err(KernelError::Inconsistency(_))));

        let two = build_consolidated(&[
            mk(1, LinkPrecedence::Primary),
            mk(3, LinkPrecedence::Primary),
        ]);
        assert!(matches!(two, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TERR-004
    #[test]
    fn merge_requires_at_least_two_candidates() {
        let mut store = MemoryStore::new();
        let ids = BTreeSet::from([ContactId(1)]);
        let result = merge_chains(&mut store, &ids, &fragment(Some("doc@hillvalley.edu"), None));
        assert!(matches!(result, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TERR-005
    #[test]
    fn merge_fails_when_no_candidate_survives_lookup() {
        let mut store = MemoryStore::new();
        let ids = BTreeSet::from([ContactId(10), ContactId(11)]);
        let result = merge_chains(&mut store, &ids, &fragment(Some("doc@hillvalley.edu"), None));
        assert!(matches!(result, Err(KernelError::Inconsistency(_))));
    }

    // Test IDs: TERR-006
    #[test]
    fn outcome_classification_covers_all_cardinalities() {
        assert_eq!(ResolutionOutcome::classify(BTreeSet::new()), ResolutionOutcome::CreateNew);
        assert_eq!(
            ResolutionOutcome::classify(BTreeSet::from([ContactId(4)])),
            ResolutionOutcome::ExtendChain(ContactId(4))
        );
        assert_eq!(
            ResolutionOutcome::classify(BTreeSet::from([ContactId(4), ContactId(9)])),
            ResolutionOutcome::MergeChains(BTreeSet::from([ContactId(4), ContactId(9)]))
        );
    }

    fn fragment_inputs() -> impl Strategy<Value = (Option<u8>, Option<u8>)> {
        (proptest::option::of(0u8..4), proptest::option::of(0u8..4))
            .prop_filter("at least one contact field", |(email, phone)| {
                email.is_some() || phone.is_some()
            })
    }

    fn fragment_from_inputs(email: Option<u8>, phone: Option<u8>) -> IdentityFragment {
        IdentityFragment::new(
            email.map(|index| format!("user{index}@hillvalley.edu")),
            phone.map(|index| format!("55500{index}")),
        )
    }

    // Test IDs: TPROP-001
    proptest! {
        #[test]
        fn property_chains_stay_flat_and_replay_is_deterministic(
            inputs in proptest::collection::vec(fragment_inputs(), 1..24)
        ) {
            let mut store = MemoryStore::new();
            let mut views = Vec::new();
            for (email, phone) in &inputs {
                let view = reconcile(&mut store, &fragment_from_inputs(*email, *phone));
                prop_assert!(view.is_ok());
                views.push(view.unwrap_or_else(|_| unreachable!()));
            }

            let records = store.records_snapshot();
            for record in records.iter().filter(|record| !record.is_deleted()) {
                match record.link_precedence {
                    LinkPrecedence::Primary => prop_assert!(record.linked_id.is_none()),
                    LinkPrecedence::Secondary => {
                        let primary = record
                            .linked_id
                            .and_then(|linked| records.iter().find(|other| other.id == linked));
                        prop_assert!(primary.is_some_and(|other| other.is_primary()));
                    }
                }
            }

            let mut replay = MemoryStore::new();
            for ((email, phone), view) in inputs.iter().zip(&views) {
                let replayed = reconcile(&mut replay, &fragment_from_inputs(*email, *phone));
                prop_assert!(replayed.is_ok());
                prop_assert_eq!(&replayed.unwrap_or_else(|_| unreachable!()), view);
            }
        }
    }
}

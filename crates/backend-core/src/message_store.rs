use std::collections::HashMap;

use crate::types::{Attachment, Message, MessagePage, PageRequest, TimelineSnapshot};

pub const DEFAULT_PAGE_SIZE: u16 = 20;
pub const DEFAULT_REFRESH_PAGE_SIZE: u16 = 30;

/// Hard upper bound accepted by the page endpoint.
pub const MAX_PAGE_LIMIT: u16 = 100;

/// Clamp a requested page limit against a cap. The result is always in `1..=100`.
pub fn bounded_page_limit(requested: u16, cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = cap.max(1);
    safe_requested.min(safe_cap).min(MAX_PAGE_LIMIT)
}

/// Loaded message window of one conversation, kept sorted ascending by id
/// with unique ids.
#[derive(Debug, Clone)]
pub struct MessageWindow {
    conversation_id: Option<i64>,
    messages: Vec<Message>,
    initial_loading: bool,
    loading_more: bool,
    has_more: bool,
    next_before_id: Option<i64>,
    page_size: u16,
    refresh_page_size: u16,
}

impl Default for MessageWindow {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, DEFAULT_REFRESH_PAGE_SIZE)
    }
}

impl MessageWindow {
    pub fn new(page_size: u16, refresh_page_size: u16) -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            initial_loading: false,
            loading_more: false,
            has_more: true,
            next_before_id: None,
            page_size: bounded_page_limit(page_size, MAX_PAGE_LIMIT),
            refresh_page_size: bounded_page_limit(refresh_page_size, MAX_PAGE_LIMIT),
        }
    }

    pub fn conversation_id(&self) -> Option<i64> {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn initial_loading(&self) -> bool {
        self.initial_loading
    }

    pub fn loading_more(&self) -> bool {
        self.loading_more
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_before_id(&self) -> Option<i64> {
        self.next_before_id
    }

    pub fn get(&self, message_id: i64) -> Option<&Message> {
        self.position(message_id).map(|idx| &self.messages[idx])
    }

    pub fn last_message_id(&self) -> Option<i64> {
        self.messages.last().map(|message| message.id)
    }

    /// Make `conversation_id` the active one and drop everything loaded.
    pub fn switch_to(&mut self, conversation_id: Option<i64>) {
        self.conversation_id = conversation_id;
        self.messages.clear();
        self.initial_loading = false;
        self.loading_more = false;
        self.has_more = true;
        self.next_before_id = None;
    }

    /// Start loading the newest page. Also used for `reload`.
    pub fn begin_initial_load(&mut self) -> Option<PageRequest> {
        let conversation_id = self.conversation_id?;
        self.initial_loading = true;
        Some(PageRequest {
            conversation_id,
            limit: self.page_size,
            before_id: None,
        })
    }

    /// Replace the window with the newest page. Returns `false` for a stale
    /// completion.
    pub fn finish_initial_load(
        &mut self,
        conversation_id: i64,
        result: Option<MessagePage>,
    ) -> bool {
        if self.conversation_id != Some(conversation_id) {
            return false;
        }
        self.initial_loading = false;

        if let Some(page) = result {
            self.messages = normalize(page.items);
            self.has_more = page.has_more;
            self.next_before_id = page.next_before_id;
        }
        true
    }

    /// Request the page strictly older than the cursor.
    ///
    /// `None` while a load is in flight, when no older page exists, or when no
    /// cursor is known.
    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        if self.loading_more || self.initial_loading || !self.has_more {
            return None;
        }
        let conversation_id = self.conversation_id?;
        let before_id = self.next_before_id?;

        self.loading_more = true;
        Some(PageRequest {
            conversation_id,
            limit: self.page_size,
            before_id: Some(before_id),
        })
    }

    /// Prepend an older page. Returns `false` for a stale completion.
    pub fn finish_load_more(&mut self, conversation_id: i64, result: Option<MessagePage>) -> bool {
        if self.conversation_id != Some(conversation_id) {
            return false;
        }
        self.loading_more = false;

        if let Some(page) = result {
            let mut merged = page.items;
            merged.append(&mut self.messages);
            self.messages = normalize(merged);
            self.has_more = page.has_more;
            self.next_before_id = page.next_before_id;
        }
        true
    }

    /// Request used by the periodic refresh. `None` while the window is empty.
    pub fn refresh_request(&self) -> Option<PageRequest> {
        if self.messages.is_empty() {
            return None;
        }
        Some(PageRequest {
            conversation_id: self.conversation_id?,
            limit: self.refresh_page_size,
            before_id: None,
        })
    }

    /// Three-way merge of a refetched newest page into the window.
    ///
    /// Only ids inside the page's `[min, max]` id range can be removed.
    /// Older ids are outside what the refetch can vouch for, and newer ones
    /// arrived after it was issued. Returns `true` when the window changed.
    pub fn reconcile(&mut self, conversation_id: i64, fresh: &[Message]) -> bool {
        if self.conversation_id != Some(conversation_id)
            || self.messages.is_empty()
            || fresh.is_empty()
        {
            return false;
        }

        let fresh_by_id: HashMap<i64, &Message> =
            fresh.iter().map(|message| (message.id, message)).collect();
        let (Some(min_fresh_id), Some(max_fresh_id)) = (
            fresh_by_id.keys().copied().min(),
            fresh_by_id.keys().copied().max(),
        ) else {
            return false;
        };

        let mut changed = false;

        let before = self.messages.len();
        self.messages.retain(|message| {
            message.id < min_fresh_id
                || message.id > max_fresh_id
                || fresh_by_id.contains_key(&message.id)
        });
        changed |= self.messages.len() != before;

        for incoming in fresh {
            match self.position(incoming.id) {
                Some(idx) => {
                    if self.messages[idx].differs_from(incoming) {
                        changed |= self.messages[idx].merge_from(incoming);
                    }
                }
                None => {
                    self.insert_sorted(incoming.clone());
                    changed = true;
                }
            }
        }

        changed
    }

    /// Insert an unknown message in id order, or merge into a known one.
    ///
    /// Messages for another conversation are ignored. Returns `true` when the
    /// window changed.
    pub fn append(&mut self, message: Message) -> bool {
        let Some(active) = self.conversation_id else {
            return false;
        };
        if message.conversation_id != 0 && message.conversation_id != active {
            return false;
        }

        match self.position(message.id) {
            Some(idx) => self.messages[idx].merge_from(&message),
            None => {
                self.insert_sorted(message);
                true
            }
        }
    }

    /// Merge fields into a known message. Unknown ids are ignored.
    pub fn update(&mut self, message: &Message) -> bool {
        match self.position(message.id) {
            Some(idx) => self.messages[idx].merge_from(message),
            None => false,
        }
    }

    /// Replace content of a known message after a local edit.
    pub fn apply_edit(&mut self, message_id: i64, content: &str, edited_at: &str) -> bool {
        let Some(idx) = self.position(message_id) else {
            return false;
        };
        let message = &mut self.messages[idx];
        message.content = Some(content.to_owned());
        message.edited_at = Some(edited_at.to_owned());
        message.updated_at = Some(edited_at.to_owned());
        true
    }

    pub fn remove(&mut self, message_id: i64) -> Option<Message> {
        self.position(message_id).map(|idx| self.messages.remove(idx))
    }

    pub fn remove_attachment(&mut self, message_id: i64, attachment_id: i64) -> bool {
        let Some(idx) = self.position(message_id) else {
            return false;
        };
        let Some(attachments) = self.messages[idx].attachments.as_mut() else {
            return false;
        };
        let before = attachments.len();
        attachments.retain(|attachment| attachment.id != attachment_id);
        attachments.len() != before
    }

    /// Find a loaded attachment by id.
    pub fn find_attachment(&self, attachment_id: i64) -> Option<&Attachment> {
        self.messages
            .iter()
            .flat_map(|message| message.attachments())
            .find(|attachment| attachment.id == attachment_id)
    }

    pub fn snapshot(&self) -> Option<TimelineSnapshot> {
        Some(TimelineSnapshot {
            conversation_id: self.conversation_id?,
            messages: self.messages.clone(),
            initial_loading: self.initial_loading,
            loading_more: self.loading_more,
            has_more: self.has_more,
        })
    }

    fn position(&self, message_id: i64) -> Option<usize> {
        self.messages
            .binary_search_by_key(&message_id, |message| message.id)
            .ok()
    }

    fn insert_sorted(&mut self, message: Message) {
        match self
            .messages
            .binary_search_by_key(&message.id, |existing| existing.id)
        {
            Ok(idx) => {
                self.messages[idx].merge_from(&message);
            }
            Err(idx) => self.messages.insert(idx, message),
        }
    }
}

/// Sort ascending by id and drop duplicate ids (first occurrence wins).
fn normalize(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|message| message.id);
    messages.dedup_by_key(|message| message.id);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, content: &str) -> Message {
        Message {
            id,
            conversation_id: 1,
            sender_id: 7,
            content: Some(content.to_owned()),
            created_at: format!("2024-05-01T10:{:02}:00", id % 60),
            edited_at: None,
            updated_at: None,
            attachments: None,
        }
    }

    fn page(ids: &[i64], has_more: bool) -> MessagePage {
        MessagePage {
            items: ids.iter().map(|id| message(*id, "x")).collect(),
            has_more,
            next_before_id: ids.iter().copied().min(),
        }
    }

    fn ids(window: &MessageWindow) -> Vec<i64> {
        window.messages().iter().map(|m| m.id).collect()
    }

    fn loaded_window(ids: &[i64]) -> MessageWindow {
        let mut window = MessageWindow::default();
        window.switch_to(Some(1));
        window.begin_initial_load().expect("initial request");
        assert!(window.finish_initial_load(1, Some(page(ids, true))));
        window
    }

    #[test]
    fn initial_load_sorts_and_dedups_page() {
        let mut window = MessageWindow::default();
        window.switch_to(Some(1));
        let request = window.begin_initial_load().expect("initial request");
        assert_eq!(request.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(request.before_id, None);
        assert!(window.initial_loading());

        assert!(window.finish_initial_load(1, Some(page(&[12, 10, 11, 10], true))));
        assert_eq!(ids(&window), vec![10, 11, 12]);
        assert!(!window.initial_loading());
        assert_eq!(window.next_before_id(), Some(10));
    }

    #[test]
    fn load_more_is_gated_by_flags_and_cursor() {
        let mut window = loaded_window(&[10, 11, 12]);

        let request = window.begin_load_more().expect("older page request");
        assert_eq!(request.before_id, Some(10));
        assert!(window.begin_load_more().is_none());

        assert!(window.finish_load_more(1, Some(page(&[8, 9], false))));
        assert_eq!(ids(&window), vec![8, 9, 10, 11, 12]);
        assert!(!window.has_more());
        assert!(window.begin_load_more().is_none());
    }

    #[test]
    fn load_more_needs_a_cursor() {
        let mut window = MessageWindow::default();
        window.switch_to(Some(1));
        window.begin_initial_load().expect("initial request");
        window.finish_initial_load(
            1,
            Some(MessagePage {
                items: Vec::new(),
                has_more: true,
                next_before_id: None,
            }),
        );
        assert!(window.begin_load_more().is_none());
    }

    #[test]
    fn stale_page_completions_are_discarded() {
        let mut window = loaded_window(&[10]);
        window.begin_load_more().expect("older page request");
        window.switch_to(Some(2));

        assert!(!window.finish_load_more(1, Some(page(&[5], false))));
        assert!(window.is_empty());
        assert!(window.has_more());
        assert!(!window.loading_more());
    }

    #[test]
    fn failed_page_only_clears_flag() {
        let mut window = loaded_window(&[10, 11]);
        window.begin_load_more().expect("older page request");
        assert!(window.finish_load_more(1, None));
        assert!(!window.loading_more());
        assert_eq!(ids(&window), vec![10, 11]);
        assert!(window.has_more());
    }

    #[test]
    fn reconcile_inserts_merges_and_removes_within_page_range() {
        let mut window = loaded_window(&[5, 10, 11, 12]);
        let fresh = vec![message(10, "edited"), message(12, "x"), message(13, "new")];

        assert!(window.reconcile(1, &fresh));
        assert_eq!(ids(&window), vec![5, 10, 12, 13]);
        assert_eq!(
            window.get(10).and_then(|m| m.content.as_deref()),
            Some("edited")
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut window = loaded_window(&[5, 10, 11]);
        let fresh = vec![message(10, "edited"), message(14, "y")];

        assert!(window.reconcile(1, &fresh));
        let after_first = window.messages().to_vec();
        assert!(!window.reconcile(1, &fresh));
        assert_eq!(window.messages(), after_first.as_slice());
    }

    #[test]
    fn reconcile_never_removes_ids_below_page_minimum() {
        let mut window = loaded_window(&[1, 2, 3, 20, 21]);
        assert!(window.reconcile(1, &[message(21, "x"), message(22, "z")]));
        assert_eq!(ids(&window), vec![1, 2, 3, 21, 22]);
    }

    #[test]
    fn reconcile_keeps_ids_newer_than_the_refetched_page() {
        let mut window = loaded_window(&[10, 11]);
        assert!(window.append(message(12, "pushed")));

        assert!(!window.reconcile(1, &[message(10, "x"), message(11, "x")]));
        assert_eq!(ids(&window), vec![10, 11, 12]);
    }

    #[test]
    fn reconcile_skips_empty_window_or_empty_page() {
        let mut window = MessageWindow::default();
        window.switch_to(Some(1));
        assert!(!window.reconcile(1, &[message(1, "x")]));
        assert!(window.is_empty());

        let mut window = loaded_window(&[3]);
        assert!(!window.reconcile(1, &[]));
        assert!(!window.reconcile(2, &[message(4, "x")]));
        assert_eq!(ids(&window), vec![3]);
    }

    #[test]
    fn mixed_operations_keep_window_sorted_and_unique() {
        let mut window = loaded_window(&[4, 8]);
        assert!(window.append(message(6, "mid")));
        assert!(window.append(message(9, "tail")));
        assert!(!window.append(message(9, "tail")));
        assert!(window.append(message(9, "tail edited")));
        assert!(window.update(&message(4, "head edited")));
        assert!(window.remove(8).is_some());
        assert!(window.remove(8).is_none());
        assert!(window.append(message(2, "older")));

        let seen = ids(&window);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seen, sorted);
        assert_eq!(seen, vec![2, 4, 6, 9]);
    }

    #[test]
    fn append_ignores_other_conversations() {
        let mut window = loaded_window(&[4]);
        let mut foreign = message(5, "elsewhere");
        foreign.conversation_id = 2;
        assert!(!window.append(foreign));
        assert_eq!(ids(&window), vec![4]);
    }

    #[test]
    fn removes_single_attachment() {
        let mut window = loaded_window(&[4]);
        let mut with_files = message(5, "files");
        with_files.attachments = Some(vec![
            Attachment {
                id: 1,
                filename: "a.txt".into(),
                content_type: None,
                size: None,
            },
            Attachment {
                id: 2,
                filename: "b.txt".into(),
                content_type: None,
                size: None,
            },
        ]);
        window.append(with_files);

        assert!(window.remove_attachment(5, 1));
        assert!(!window.remove_attachment(5, 1));
        assert_eq!(window.get(5).map(|m| m.attachments().len()), Some(1));
        assert_eq!(
            window.find_attachment(2).map(|a| a.filename.as_str()),
            Some("b.txt")
        );
    }

    #[test]
    fn bounds_page_limit_for_safety() {
        assert_eq!(bounded_page_limit(0, 200), 1);
        assert_eq!(bounded_page_limit(25, 10), 10);
        assert_eq!(bounded_page_limit(150, 500), 100);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::{BTreeMap, BTreeSet};

        #[derive(Debug, Clone)]
        enum WindowOp {
            Append(i64, String),
            Update(i64, String),
            Remove(i64),
            Reconcile(BTreeMap<i64, String>),
        }

        fn arb_ids() -> impl Strategy<Value = BTreeSet<i64>> {
            prop::collection::btree_set(1i64..60, 1..12)
        }

        fn arb_page() -> impl Strategy<Value = BTreeMap<i64, String>> {
            prop::collection::btree_map(1i64..60, "[ab]", 1..12)
        }

        fn arb_op() -> impl Strategy<Value = WindowOp> {
            prop_oneof![
                (1i64..60, "[ab]").prop_map(|(id, content)| WindowOp::Append(id, content)),
                (1i64..60, "[ab]").prop_map(|(id, content)| WindowOp::Update(id, content)),
                (1i64..60).prop_map(WindowOp::Remove),
                arb_page().prop_map(WindowOp::Reconcile),
            ]
        }

        fn fresh_page(page: &BTreeMap<i64, String>) -> Vec<Message> {
            page.iter()
                .map(|(id, content)| message(*id, content))
                .collect()
        }

        fn window_with(ids: &BTreeSet<i64>) -> MessageWindow {
            loaded_window(&ids.iter().copied().collect::<Vec<_>>())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn prop_window_stays_sorted_and_unique(
                initial in arb_ids(),
                ops in prop::collection::vec(arb_op(), 0..40),
            ) {
                let mut window = window_with(&initial);
                for op in ops {
                    match op {
                        WindowOp::Append(id, content) => {
                            window.append(message(id, &content));
                        }
                        WindowOp::Update(id, content) => {
                            window.update(&message(id, &content));
                        }
                        WindowOp::Remove(id) => {
                            window.remove(id);
                        }
                        WindowOp::Reconcile(page) => {
                            window.reconcile(1, &fresh_page(&page));
                        }
                    }
                    let seen = ids(&window);
                    prop_assert!(
                        seen.windows(2).all(|pair| pair[0] < pair[1]),
                        "window out of order or duplicated: {:?}",
                        seen
                    );
                }
            }

            #[test]
            fn prop_reconcile_is_idempotent(initial in arb_ids(), page in arb_page()) {
                let fresh = fresh_page(&page);
                let mut window = window_with(&initial);

                window.reconcile(1, &fresh);
                let after_first = window.messages().to_vec();

                prop_assert!(!window.reconcile(1, &fresh));
                prop_assert_eq!(window.messages(), after_first.as_slice());
            }

            #[test]
            fn prop_reconcile_only_removes_inside_page_range(
                initial in arb_ids(),
                page in arb_page(),
            ) {
                let mut window = window_with(&initial);
                let (Some(&min), Some(&max)) = (page.keys().next(), page.keys().next_back()) else {
                    return Ok(());
                };

                window.reconcile(1, &fresh_page(&page));

                let kept: BTreeSet<i64> = ids(&window).into_iter().collect();
                for id in initial.iter().filter(|id| **id < min || **id > max) {
                    prop_assert!(
                        kept.contains(id),
                        "id {} outside [{}, {}] was removed",
                        id,
                        min,
                        max
                    );
                }
                for id in page.keys() {
                    prop_assert!(kept.contains(id), "fresh id {} missing", id);
                }
            }
        }
    }
}

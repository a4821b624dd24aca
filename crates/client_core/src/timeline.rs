//! Timeline entries and the single reconciliation step that mutates them.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use shared::domain::{MessageId, Participant, SessionId, TempId, UserId};

use crate::types::{Attachment, FileUpload, Message, MessageStatus};

/// A message typed locally that has no server id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub temp_id: TempId,
    pub session_id: SessionId,
    pub sender: Participant,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub files: Vec<FileUpload>,
    pub inserted_at: DateTime<Utc>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Confirmed(Message),
    Pending(LocalMessage),
    Failed(LocalMessage),
}

impl TimelineEntry {
    /// Server timestamp for confirmed entries, local insertion time otherwise.
    pub fn sort_key(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Confirmed(message) => message.timestamp,
            TimelineEntry::Pending(local) | TimelineEntry::Failed(local) => local.inserted_at,
        }
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            TimelineEntry::Confirmed(message) => message.status,
            TimelineEntry::Pending(_) => MessageStatus::Pending,
            TimelineEntry::Failed(_) => MessageStatus::Failed,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Confirmed(message) => &message.content,
            TimelineEntry::Pending(local) | TimelineEntry::Failed(local) => &local.content,
        }
    }

    pub fn sender(&self) -> &Participant {
        match self {
            TimelineEntry::Confirmed(message) => &message.sender,
            TimelineEntry::Pending(local) | TimelineEntry::Failed(local) => &local.sender,
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        match self {
            TimelineEntry::Confirmed(message) => &message.attachments,
            TimelineEntry::Pending(local) | TimelineEntry::Failed(local) => &local.attachments,
        }
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            TimelineEntry::Confirmed(message) => Some(&message.id),
            _ => None,
        }
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self {
            TimelineEntry::Confirmed(_) => None,
            TimelineEntry::Pending(local) | TimelineEntry::Failed(local) => Some(local.temp_id),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Transition {
    Insert(LocalMessage),
    Confirm { temp_id: TempId, message: Message },
    Fail { temp_id: TempId, reason: String },
    Pushed(Message),
    History(Vec<Message>),
    StatusAdvance { ids: Vec<MessageId>, status: MessageStatus },
}

#[derive(Debug, Default)]
pub(crate) struct TimelineState {
    pub entries: Vec<TimelineEntry>,
}

impl TimelineState {
    /// Applies one transition. Returns whether anything changed.
    pub fn reconcile(&mut self, transition: Transition) -> bool {
        let changed = match transition {
            Transition::Insert(local) => {
                self.entries.push(TimelineEntry::Pending(local));
                true
            }
            Transition::Confirm { temp_id, message } => self.confirm(temp_id, message),
            Transition::Fail { temp_id, reason } => self.fail(temp_id, reason),
            Transition::Pushed(message) => self.merge_confirmed(message),
            Transition::History(messages) => {
                let mut changed = false;
                for message in messages {
                    changed |= self.merge_confirmed(message);
                }
                changed
            }
            Transition::StatusAdvance { ids, status } => {
                let mut changed = false;
                for entry in &mut self.entries {
                    if let TimelineEntry::Confirmed(message) = entry {
                        if ids.contains(&message.id) && advances(message.status, status) {
                            message.status = status;
                            changed = true;
                        }
                    }
                }
                changed
            }
        };
        if changed {
            self.entries.sort_by_key(TimelineEntry::sort_key);
        }
        changed
    }

    fn position_of_pending(&self, temp_id: TempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| matches!(entry, TimelineEntry::Pending(local) if local.temp_id == temp_id))
    }

    fn position_of_confirmed(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message_id() == Some(id))
    }

    /// Replaces the pending entry in place. A pushed echo of the same message
    /// that arrived first is folded into it.
    fn confirm(&mut self, temp_id: TempId, message: Message) -> bool {
        let Some(index) = self.position_of_pending(temp_id) else {
            return false;
        };
        let mut message = message;
        if let Some(echo) = self.position_of_confirmed(&message.id) {
            if let TimelineEntry::Confirmed(existing) = &self.entries[echo] {
                if advances(message.status, existing.status) {
                    message.status = existing.status;
                }
            }
        }
        let id = message.id.clone();
        self.entries[index] = TimelineEntry::Confirmed(message);
        let mut position = 0;
        self.entries.retain(|entry| {
            let keep = position == index || entry.message_id() != Some(&id);
            position += 1;
            keep
        });
        true
    }

    fn fail(&mut self, temp_id: TempId, reason: String) -> bool {
        let Some(index) = self.position_of_pending(temp_id) else {
            return false;
        };
        let TimelineEntry::Pending(local) = &self.entries[index] else {
            return false;
        };
        let mut local = local.clone();
        local.failure = Some(reason);
        self.entries[index] = TimelineEntry::Failed(local);
        true
    }

    fn merge_confirmed(&mut self, message: Message) -> bool {
        match self.position_of_confirmed(&message.id) {
            Some(index) => {
                let TimelineEntry::Confirmed(existing) = &mut self.entries[index] else {
                    return false;
                };
                if advances(existing.status, message.status) {
                    existing.status = message.status;
                    true
                } else {
                    false
                }
            }
            None => {
                self.entries.push(TimelineEntry::Confirmed(message));
                true
            }
        }
    }
}

fn advances(current: MessageStatus, next: MessageStatus) -> bool {
    match (current.confirmed_rank(), next.confirmed_rank()) {
        (Some(current), Some(next)) => next > current,
        _ => false,
    }
}

/// Consecutive entries from one sender within a day.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderRun {
    pub sender: UserId,
    pub entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub day: NaiveDate,
    pub runs: Vec<SenderRun>,
}

/// Groups `entries` by calendar day in `offset`, then by consecutive sender.
pub fn group_entries(entries: &[TimelineEntry], offset: FixedOffset) -> Vec<DayGroup> {
    let mut days: Vec<DayGroup> = Vec::new();
    for entry in entries {
        let day = entry.sort_key().with_timezone(&offset).date_naive();
        if days.last().map(|group| group.day) != Some(day) {
            days.push(DayGroup {
                day,
                runs: Vec::new(),
            });
        }
        let Some(group) = days.last_mut() else { continue };
        let sender = &entry.sender().id;
        match group.runs.last_mut() {
            Some(run) if &run.sender == sender => run.entries.push(entry.clone()),
            _ => group.runs.push(SenderRun {
                sender: sender.clone(),
                entries: vec![entry.clone()],
            }),
        }
    }
    days
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;

use crate::predicate::Predicate;

/// How much of each row to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Detail {
    /// Fixed and declared columns; the document reads as `null`.
    Summary,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Page {
    pub fn new(limit: Option<u64>, offset: u64) -> Self {
        Self { limit, offset }
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit.is_none() && self.offset == 0
    }

    /// Slice an in-memory result the same way LIMIT/OFFSET would.
    pub(crate) fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let take = self
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        items.into_iter().skip(skip).take(take).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub detail: Detail,
    pub predicate: Option<Predicate>,
    pub page: Page,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detail(mut self, detail: Detail) -> Self {
        self.detail = detail;
        self
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }
}

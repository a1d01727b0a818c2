use crate::ops::repository::RepositoryOps;

pub struct App<R: RepositoryOps> {
    pub repo: R,
}

impl<R: RepositoryOps> App<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

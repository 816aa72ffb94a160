//! Query interception.

use crate::query::Query;

/// Rewrites every query when its builder is constructed, before the caller
/// adds clauses. Typical use is a mandatory filter such as tenant scoping.
///
/// Closures of the right shape are hooks:
///
/// ```ignore
/// let hook = |query: Query| query.filter(tenant.clone().eq(7));
/// ```
pub trait QueryHook: Send + Sync {
    fn intercept(&self, query: Query) -> Query;
}

impl<F> QueryHook for F
where
    F: Fn(Query) -> Query + Send + Sync,
{
    fn intercept(&self, query: Query) -> Query {
        self(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeorm_core::Node;

    struct OnlyActive;

    impl QueryHook for OnlyActive {
        fn intercept(&self, query: Query) -> Query {
            let active = query.root().column_of("active");
            query.filter(active.eq(true))
        }
    }

    #[test]
    fn hooks_rewrite_queries() {
        let query = OnlyActive.intercept(Query::new("main", "account"));
        assert_eq!(query.filters().len(), 1);

        let limit = |query: Query| query.limit(0, 100);
        let hooks: Vec<Box<dyn QueryHook>> = vec![Box::new(OnlyActive), Box::new(limit)];
        let query = hooks
            .iter()
            .fold(Query::new("main", "account"), |q, hook| hook.intercept(q));
        assert_eq!(query.window(), (0, Some(100)));
        assert_eq!(
            query.filters()[0],
            Node::table("main", "account").column_of("active").eq(true)
        );
    }
}

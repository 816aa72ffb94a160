use asupersync::runtime::RuntimeBuilder;

use nodeorm::prelude::*;
use nodeorm::{KeyFilter, LockCheck, QueryPlan, Row};
use std::sync::atomic::{AtomicUsize, Ordering};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn assert_cancelled<T>(outcome: Outcome<T, Error>) {
    match outcome {
        Outcome::Cancelled(_) => {}
        Outcome::Ok(_) => panic!("expected cancellation, got Ok"),
        Outcome::Err(e) => panic!("expected cancellation, got error: {e}"),
        Outcome::Panicked(p) => panic!("expected cancellation, got panic: {p:?}"),
    }
}

fn schema() -> Arc<dyn SchemaMetadata> {
    Arc::new(
        Schema::builder("main")
            .table(
                TableDef::new("author")
                    .auto_key("id")
                    .column("name", SqlType::Text),
            )
            .table(
                TableDef::new("book")
                    .auto_key("id")
                    .column("title", SqlType::Text)
                    .reference(ReferenceDef::new("author", "author").reverse("books")),
            )
            .build()
            .expect("valid schema"),
    )
}

fn author_with_books<S: RowStore>(session: &Session<S>, books: usize) -> Record {
    let mut author = session.new_record("author");
    author.set("name", "author");
    for i in 0..books {
        let mut book = session.new_record("book");
        book.set("title", format!("book {i}"));
        author.add_link("books", book);
    }
    author
}

/// Store wrapper that requests cancellation of `cx` once `allowed` writes
/// have gone through, so the next write sees it.
struct CancelAfterWrites<T> {
    inner: T,
    cx: Cx,
    allowed: usize,
    writes: Arc<AtomicUsize>,
}

impl<T> CancelAfterWrites<T> {
    fn new(inner: T, cx: &Cx, allowed: usize) -> Self {
        Self {
            inner,
            cx: cx.clone(),
            allowed,
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn wrap<U>(&self, inner: U) -> CancelAfterWrites<U> {
        CancelAfterWrites {
            inner,
            cx: self.cx.clone(),
            allowed: self.allowed,
            writes: Arc::clone(&self.writes),
        }
    }

    fn tick(&self) {
        if self.writes.fetch_add(1, Ordering::SeqCst) == self.allowed {
            self.cx.set_cancel_requested(true);
        }
    }
}

impl<T: RowStore> RowStore for CancelAfterWrites<T> {
    type Cursor = T::Cursor;
    type Tx<'s>
        = CancelAfterWrites<T::Tx<'s>>
    where
        Self: 's;

    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        self.tick();
        self.inner.insert(cx, table, values)
    }

    fn update(
        &self,
        cx: &Cx,
        table: &str,
        values: &[(String, Value)],
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.tick();
        self.inner.update(cx, table, values, filter, lock)
    }

    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        filter: &KeyFilter,
        lock: Option<LockCheck<'_>>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.tick();
        self.inner.delete(cx, table, filter, lock)
    }

    fn select(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.inner.select(cx, plan)
    }

    fn select_cursor(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
    ) -> impl Future<Output = Outcome<Self::Cursor, Error>> + Send {
        self.inner.select_cursor(cx, plan)
    }

    fn count(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.inner.count(cx, plan)
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let begin = self.inner.begin(cx);
        async move {
            match begin.await {
                Outcome::Ok(tx) => Outcome::Ok(self.wrap(tx)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}

impl<T: TransactionOps> TransactionOps for CancelAfterWrites<T> {
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.commit(cx)
    }

    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.rollback(cx)
    }
}

#[test]
fn save_after_cancel_writes_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));

    rt.block_on(async {
        for transactional in [true, false] {
            let session = Session::with_config(
                store.clone(),
                Arc::clone(&schema),
                SessionConfig::new().transactional_cascade(transactional),
            );
            let mut author = author_with_books(&session, 2);
            cx.set_cancel_requested(true);
            assert_cancelled(session.save(&cx, &mut author).await);
            cx.set_cancel_requested(false);
            assert!(author.is_new());
        }
    });

    assert_eq!(store.row_count("author"), 0);
    assert_eq!(store.row_count("book"), 0);
    assert_eq!(store.open_transactions(), 0);
}

#[test]
fn cancel_between_cascade_writes_discards_the_whole_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));
    let session = Session::new(CancelAfterWrites::new(store.clone(), &cx, 1), schema);

    rt.block_on(async {
        let mut author = author_with_books(&session, 2);
        assert_cancelled(session.save(&cx, &mut author).await);
        assert!(author.is_new());
        assert_eq!(author.get("id").expect("id"), Value::Null);
    });

    assert_eq!(store.row_count("author"), 0);
    assert_eq!(store.row_count("book"), 0);
    assert_eq!(store.open_transactions(), 0);
}

#[test]
fn cancel_between_writes_without_transactions_keeps_earlier_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));
    let session = Session::with_config(
        CancelAfterWrites::new(store.clone(), &cx, 1),
        schema,
        SessionConfig::new().transactional_cascade(false),
    );

    rt.block_on(async {
        let mut author = author_with_books(&session, 2);
        assert_cancelled(session.save(&cx, &mut author).await);
    });

    assert_eq!(store.row_count("author"), 1);
    assert_eq!(store.row_count("book"), 0);
    assert_eq!(store.open_transactions(), 0);
}

#[test]
fn cancelled_delete_keeps_the_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));
    let session = Session::new(store.clone(), Arc::clone(&schema));

    rt.block_on(async {
        let mut author = author_with_books(&session, 2);
        unwrap_outcome(session.save(&cx, &mut author).await);

        cx.set_cancel_requested(true);
        assert_cancelled(session.delete(&cx, &mut author).await);
        cx.set_cancel_requested(false);
        assert!(!author.is_new());

        // Cancelled partway through removing the children.
        let midway = Session::new(CancelAfterWrites::new(store.clone(), &cx, 1), schema);
        assert_cancelled(midway.delete(&cx, &mut author).await);
        cx.set_cancel_requested(false);
        assert!(!author.is_new());
    });

    assert_eq!(store.row_count("author"), 1);
    assert_eq!(store.row_count("book"), 2);
    assert_eq!(store.open_transactions(), 0);
}

#[test]
fn cancelled_loads_return_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let session = Session::new(MemoryStore::new(Arc::clone(&schema)), schema);

    rt.block_on(async {
        let mut author = author_with_books(&session, 2);
        unwrap_outcome(session.save(&cx, &mut author).await);
        let books = session.node("author").link("books").node();

        cx.set_cancel_requested(true);
        assert_cancelled(session.query("author").load(&cx).await);
        assert_cancelled(session.query("author").select([books]).get(&cx).await);
        assert_cancelled(session.query("book").count(&cx).await);
        assert_cancelled(session.load_link(&cx, &mut author, "books").await);
        assert_cancelled(session.query("book").load_cursor(&cx).await);
    });

    assert_eq!(session.store().open_cursors(), 0);
}

#[test]
fn cursor_stops_at_cancellation_and_releases_its_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let session = Session::new(MemoryStore::new(Arc::clone(&schema)), schema);

    rt.block_on(async {
        let mut author = author_with_books(&session, 3);
        unwrap_outcome(session.save(&cx, &mut author).await);

        let mut cursor = unwrap_outcome(session.query("book").load_cursor(&cx).await);
        assert_eq!(session.store().open_cursors(), 1);
        let first = unwrap_outcome(cursor.next(&cx).await).expect("first book");
        assert_eq!(first.get("title").expect("title"), Value::from("book 0"));

        cx.set_cancel_requested(true);
        assert_cancelled(cursor.next(&cx).await);
        drop(cursor);
    });

    assert_eq!(session.store().open_cursors(), 0);
}

use asupersync::runtime::RuntimeBuilder;

use nodeorm::prelude::*;
use std::collections::HashSet;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
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

fn author_with_books(session: &Session<MemoryStore>, name: &str, books: usize) -> Record {
    let mut author = session.new_record("author");
    author.set("name", name);
    for i in 0..books {
        let mut book = session.new_record("book");
        book.set("title", format!("{name} #{i}"));
        author.add_link("books", book);
    }
    author
}

fn names(store: &MemoryStore) -> Vec<String> {
    store
        .dump("author")
        .iter()
        .map(|row| row.get_named::<String>("name").expect("name column"))
        .collect()
}

const WORKERS: usize = 4;
const SAVES_PER_WORKER: usize = 50;

#[test]
fn threads_saving_through_one_store_keep_every_row() {
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let store = store.clone();
            let schema = Arc::clone(&schema);
            scope.spawn(move || {
                let rt = RuntimeBuilder::current_thread()
                    .build()
                    .expect("create asupersync runtime");
                let cx = Cx::for_testing();
                let session = Session::new(store, schema);
                rt.block_on(async {
                    for i in 0..SAVES_PER_WORKER {
                        let mut author = author_with_books(&session, &format!("w{worker}-{i}"), 2);
                        unwrap_outcome(session.save(&cx, &mut author).await);
                        assert!(!author.is_new());
                    }
                });
            });
        }
    });

    let total = WORKERS * SAVES_PER_WORKER;
    assert_eq!(store.row_count("author"), total);
    assert_eq!(store.row_count("book"), total * 2);
    assert_eq!(store.open_transactions(), 0);

    let authors: HashSet<i64> = store
        .dump("author")
        .iter()
        .map(|row| row.get_named::<i64>("id").expect("id column"))
        .collect();
    assert_eq!(authors.len(), total);
    for book in store.dump("book") {
        let author: i64 = book.get_named("author_id").expect("author_id column");
        assert!(authors.contains(&author), "book points at missing author {author}");
    }
}

#[test]
fn open_transaction_neither_blocks_nor_undoes_other_sessions() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));
    let direct = Session::with_config(
        store.clone(),
        Arc::clone(&schema),
        SessionConfig::new().transactional_cascade(false),
    );
    let cascading = Session::new(store.clone(), schema);

    rt.block_on(async {
        let pending = unwrap_outcome(store.begin(&cx).await);
        unwrap_outcome(
            pending
                .insert(&cx, "author", &[("name".to_string(), Value::from("pending"))])
                .await,
        );

        let mut first = author_with_books(&direct, "direct", 1);
        unwrap_outcome(direct.save(&cx, &mut first).await);
        let mut second = author_with_books(&cascading, "cascading", 1);
        unwrap_outcome(cascading.save(&cx, &mut second).await);
        assert_eq!(store.open_transactions(), 1);
        assert_eq!(names(&store), vec!["direct", "cascading"]);

        unwrap_outcome(pending.rollback(&cx).await);
    });

    assert_eq!(names(&store), vec!["direct", "cascading"]);
    assert_eq!(store.row_count("book"), 2);
    assert_eq!(store.open_transactions(), 0);
}

#[test]
fn transaction_losing_to_a_session_delete_fails_to_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::new(Arc::clone(&schema));
    let session = Session::new(store.clone(), schema);

    rt.block_on(async {
        let mut author = author_with_books(&session, "gone", 0);
        unwrap_outcome(session.save(&cx, &mut author).await);

        let tx = unwrap_outcome(store.begin(&cx).await);
        let key = author.require_key().expect("saved key");
        let renamed = [("name".to_string(), Value::from("late"))];
        assert_eq!(unwrap_outcome(tx.update(&cx, "author", &renamed, &key, None).await), 1);

        unwrap_outcome(session.delete(&cx, &mut author).await);
        match tx.commit(&cx).await {
            Outcome::Err(e) => assert!(e.is_retryable(), "unexpected error: {e}"),
            other => panic!("expected a serialization failure, got {other:?}"),
        }
    });

    assert_eq!(store.row_count("author"), 0);
    assert_eq!(store.open_transactions(), 0);
}

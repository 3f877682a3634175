use annosync_client::store::{AnnotationIndex, LocalAnnotationRecord, SqliteAnnotationIndex};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Write {
    /// The viewer's own view of the annotation, before confirmation.
    PutPending,
    /// The store's confirmation push.
    PutConfirmed,
    /// A modify that keeps the page.
    UpdateSamePage,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    prop_oneof![Just(Write::PutPending), Just(Write::PutConfirmed), Just(Write::UpdateSamePage)]
}

/// Some interleaving of writes that contains at least one confirmation.
fn interleaving() -> impl Strategy<Value = Vec<Write>> {
    (prop::collection::vec(write_strategy(), 0..8), any::<prop::sample::Index>()).prop_map(
        |(mut writes, position)| {
            let at = position.index(writes.len() + 1);
            writes.insert(at, Write::PutConfirmed);
            writes
        },
    )
}

fn apply(index: &mut SqliteAnnotationIndex, write: Write, page: u32) {
    match write {
        Write::PutPending => {
            index
                .put(&LocalAnnotationRecord::new("a1", None, "d1", page))
                .expect("pending put should succeed");
        }
        Write::PutConfirmed => {
            index
                .put(&LocalAnnotationRecord::new("a1", Some("s1".into()), "d1", page))
                .expect("confirmed put should succeed");
        }
        Write::UpdateSamePage => {
            index.update_page_number("a1", "s1", "d1", page).expect("update should succeed");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn any_arrival_order_leaves_one_confirmed_record(writes in interleaving(), page in 1u32..500) {
        let mut index = SqliteAnnotationIndex::open_in_memory().expect("index should open");
        for write in &writes {
            apply(&mut index, *write, page);
        }

        let records = index.records_for_document("d1").expect("listing should succeed");
        let confirmed = LocalAnnotationRecord::new("a1", Some("s1".into()), "d1", page);
        prop_assert_eq!(records, vec![confirmed]);
    }

    #[test]
    fn same_page_updates_never_write(updates in 1usize..10, page in 1u32..500) {
        let mut index = SqliteAnnotationIndex::open_in_memory().expect("index should open");
        apply(&mut index, Write::PutConfirmed, page);
        let writes_after_put = index.write_count();

        for _ in 0..updates {
            apply(&mut index, Write::UpdateSamePage, page);
        }
        prop_assert_eq!(index.write_count(), writes_after_put);
    }
}

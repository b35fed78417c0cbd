use crate::{AsyncEnumerator, DynEnumerator, Fault, Incomplete};

/// Drains an [`AsyncEnumerator`] into a `COLLECTION`.
///
/// This is the canonical consumer loop: wait until a value can be drained, then drain
/// synchronously until the sequence has to wait again.
pub struct Collector<ITEM, COLLECTION: Default + Extend<ITEM>> {
    enumerator: DynEnumerator<ITEM>,
    collector: COLLECTION,
}

impl<ITEM, COLLECTION: Default + Extend<ITEM>> From<DynEnumerator<ITEM>>
    for Collector<ITEM, COLLECTION>
{
    fn from(value: DynEnumerator<ITEM>) -> Self {
        Collector {
            enumerator: value,
            collector: Default::default(),
        }
    }
}

impl<ITEM, COLLECTION: Default + Extend<ITEM>> Collector<ITEM, COLLECTION> {
    /// Run the sequence to its end and return everything it produced.
    ///
    /// The enumerator is disposed afterwards, also when the sequence faulted.
    pub async fn collect(self) -> Result<COLLECTION, Fault> {
        let Collector {
            enumerator,
            mut collector,
        } = self;
        let result = for_each(enumerator.as_ref(), |item| {
            collector.extend(std::iter::once(item))
        })
        .await;
        let _ = enumerator.dispose().await;
        result.map(|_| collector)
    }
}

/// Run `action` for every value of the sequence, in order.
pub async fn for_each<ITEM, E, F>(enumerator: &E, mut action: F) -> Result<(), Fault>
where
    E: AsyncEnumerator<ITEM> + ?Sized,
    F: FnMut(ITEM),
{
    while enumerator.wait_for_next().await? {
        loop {
            match enumerator.try_get_next() {
                Ok(item) => action(item),
                Err(Incomplete::Suspended | Incomplete::OutOfTurn) => break,
                Err(Incomplete::Exhausted) => return Ok(()),
                Err(Incomplete::Faulted(fault)) => return Err(fault),
            }
        }
    }
    Ok(())
}

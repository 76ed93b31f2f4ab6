use crate::error::Result;

/// Handle for one GPU address space (page tables live with the collaborator).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MmuContext {
    id: u64,
    page_table_base: u64,
}

impl MmuContext {
    pub fn new(id: u64, page_table_base: u64) -> Self {
        Self {
            id,
            page_table_base,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_table_base(&self) -> u64 {
        self.page_table_base
    }
}

/// MMU/context-switch collaborator. `bind` makes the context the one the
/// hardware translates through; `unbind` drops the hardware's use of it.
pub trait AddressSpace: Send + Sync {
    fn bind(&self, context: &MmuContext) -> Result<()>;
    fn unbind(&self, context: &MmuContext);
}

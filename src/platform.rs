// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// The parts of the SoC around the UDPHS that the driver needs but doesn't
/// own: the interrupt controller, the PMC, the L1 data cache, the MMU, and
/// whatever the board does when the bus suspends.
pub trait Platform {
    /// Masks the UDPHS interrupt and returns whatever `restore_irq` needs to
    /// put things back. Calls nest.
    fn mask_irq(&self) -> bool;
    /// Undoes the matching `mask_irq`.
    fn restore_irq(&self, was_enabled: bool);

    /// Unmasks the UDPHS interrupt line at the interrupt controller.
    fn enable_irq(&self);
    /// Masks the UDPHS interrupt line at the interrupt controller.
    fn disable_irq(&self);

    /// Turns on the UDPHS peripheral clock.
    fn enable_clock(&self);
    /// Gates the UDPHS peripheral clock, for suspend and shutdown.
    fn disable_clock(&self);

    /// Writes back dirty cache lines covering `[start, end)`.
    fn clean_dcache(&self, start: usize, end: usize);
    /// Discards cache lines covering `[start, end)`.
    fn invalidate_dcache(&self, start: usize, end: usize);

    /// Translates a buffer address into the bus address the DMA engine sees.
    fn phys_addr(&self, virt: usize) -> u32 {
        virt as u32
    }

    /// Board hook for bus suspend (`resume == false`) and resume. Boards
    /// that can cut power to things while suspended do it here.
    fn board_suspend(&self, resume: bool) {
        let _ = resume;
    }
}
